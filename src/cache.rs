//! The in-memory decision cache.
//!
//! Two maps keyed by canonical MAC: `active` holds everything needed to
//! answer a request without touching the store, `staging` marks MACs that
//! contacted the server but have no operator-assigned address yet. A MAC is
//! in at most one of the two maps at any time.
//!
//! Store-derived mutations are applied only by the reconciler; the decision
//! engine reads the maps and additionally places the optimistic staging mark
//! (see [`Cache::mark_staging`]). Both sides go through the same blocking
//! mutex, so readers always observe a consistent snapshot.

use core::cell::RefCell;
use core::net::Ipv4Addr;

use std::collections::HashMap;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::store::{OwnerId, OwnerRow};
use crate::Mac;

/// The cached projection of an active owner row: everything a reply needs,
/// with the netmask precomputed from the profile network so the hot path
/// never parses CIDR.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ActiveEntry {
    pub owner_id: OwnerId,
    pub ip_addr: Ipv4Addr,
    pub relay_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub router_ip: Option<Ipv4Addr>,
    pub dns_ips: Vec<Ipv4Addr>,
    pub ntp_ips: Vec<Ipv4Addr>,
    pub lease_secs: u32,
}

#[derive(Debug, Default)]
pub struct CacheInner {
    active: HashMap<Mac, ActiveEntry>,
    staging: HashMap<Mac, Ipv4Addr>,
}

impl CacheInner {
    pub fn active(&self, mac: Mac) -> Option<&ActiveEntry> {
        self.active.get(&mac)
    }

    pub fn staging(&self, mac: Mac) -> Option<Ipv4Addr> {
        self.staging.get(&mac).copied()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    /// Folds one store row into the maps.
    ///
    /// An assigned row moves the MAC to `active` (clearing any staging mark);
    /// an unassigned row marks the MAC as staging without touching `active`.
    pub fn apply_row(&mut self, row: &OwnerRow) {
        if let Some(ip_addr) = row.ip_addr {
            self.staging.remove(&row.mac_addr);
            self.active.insert(
                row.mac_addr,
                ActiveEntry {
                    owner_id: row.id,
                    ip_addr,
                    relay_ip: row.relay_ip,
                    netmask: row.network_addr.netmask(),
                    router_ip: row.router_ip,
                    dns_ips: row.dns_ips.clone(),
                    ntp_ips: row.ntp_ips.clone(),
                    lease_secs: row.lease_time.as_secs() as _,
                },
            );
        } else {
            self.staging.insert(row.mac_addr, row.relay_ip);
        }
    }

    pub fn mark_staging(&mut self, mac: Mac, relay_ip: Ipv4Addr) {
        self.staging.insert(mac, relay_ip);
    }

    pub fn remove_active(&mut self, mac: Mac) -> bool {
        self.active.remove(&mac).is_some()
    }

    pub fn remove_staging(&mut self, mac: Mac) -> bool {
        self.staging.remove(&mac).is_some()
    }
}

/// The shared handle to the cache.
pub struct Cache<M>(Mutex<M, RefCell<CacheInner>>)
where
    M: RawMutex;

impl<M> Cache<M>
where
    M: RawMutex,
{
    pub fn new() -> Self {
        Self(Mutex::new(RefCell::new(CacheInner::default())))
    }

    /// Runs `f` against the maps under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut CacheInner) -> R) -> R {
        self.0.lock(|inner| f(&mut inner.borrow_mut()))
    }

    pub fn lookup_active(&self, mac: Mac) -> Option<ActiveEntry> {
        self.with(|inner| inner.active(mac).cloned())
    }

    pub fn in_staging(&self, mac: Mac) -> bool {
        self.with(|inner| inner.staging(mac).is_some())
    }

    pub fn apply_row(&self, row: &OwnerRow) {
        self.with(|inner| inner.apply_row(row))
    }

    pub fn mark_staging(&self, mac: Mac, relay_ip: Ipv4Addr) {
        self.with(|inner| inner.mark_staging(mac, relay_ip))
    }

    pub fn remove_active(&self, mac: Mac) -> bool {
        self.with(|inner| inner.remove_active(mac))
    }

    pub fn remove_staging(&self, mac: Mac) -> bool {
        self.with(|inner| inner.remove_staging(mac))
    }
}

impl<M> Default for Cache<M>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use core::time::Duration;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use crate::store::Ipv4Net;

    use super::*;

    fn mac() -> Mac {
        "de:12:44:4c:bb:48".parse().unwrap()
    }

    fn row(ip_addr: Option<Ipv4Addr>) -> OwnerRow {
        OwnerRow {
            id: 1,
            mac_addr: mac(),
            ip_addr,
            relay_ip: Ipv4Addr::new(10, 0, 0, 1),
            network_addr: "192.168.7.0/24".parse::<Ipv4Net>().unwrap(),
            router_ip: None,
            dns_ips: Vec::new(),
            ntp_ips: Vec::new(),
            lease_time: Duration::from_secs(3600),
        }
    }

    fn assert_disjoint(cache: &Cache<NoopRawMutex>) {
        cache.with(|inner| {
            for key in inner.staging.keys() {
                assert!(!inner.active.contains_key(key));
            }
        });
    }

    #[test]
    fn unassigned_row_stages() {
        let cache = Cache::<NoopRawMutex>::new();

        cache.apply_row(&row(None));

        assert!(cache.in_staging(mac()));
        assert!(cache.lookup_active(mac()).is_none());
        assert_disjoint(&cache);
    }

    #[test]
    fn assignment_moves_to_active() {
        let cache = Cache::<NoopRawMutex>::new();

        cache.apply_row(&row(None));
        cache.apply_row(&row(Some(Ipv4Addr::new(192, 168, 7, 2))));

        assert!(!cache.in_staging(mac()));

        let entry = cache.lookup_active(mac()).unwrap();
        assert_eq!(entry.ip_addr, Ipv4Addr::new(192, 168, 7, 2));
        assert_eq!(entry.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(entry.lease_secs, 3600);
        assert_disjoint(&cache);
    }

    #[test]
    fn reload_is_idempotent() {
        let cache = Cache::<NoopRawMutex>::new();
        let assigned = row(Some(Ipv4Addr::new(192, 168, 7, 2)));

        cache.apply_row(&assigned);
        let once = cache.lookup_active(mac());

        cache.apply_row(&assigned);
        let twice = cache.lookup_active(mac());

        assert_eq!(once, twice);
        assert_disjoint(&cache);
    }

    #[test]
    fn removals_are_idempotent() {
        let cache = Cache::<NoopRawMutex>::new();

        cache.apply_row(&row(Some(Ipv4Addr::new(192, 168, 7, 2))));

        assert!(cache.remove_active(mac()));
        assert!(!cache.remove_active(mac()));
        assert!(!cache.remove_staging(mac()));
    }
}
