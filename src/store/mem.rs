//! An in-memory control store for tests and demos.
//!
//! Models the `profile` and `owner` tables with their uniqueness constraints
//! (`profile.name`, `profile.relay_ip`, `(profile, mac)`, `(profile, ip)`),
//! the insert-returning-id staging transaction, the cascade from profile
//! deletion, and the notification channel. Rows are ordered by a process-wide
//! modification sequence standing in for `modify_date`.

use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt;
use core::net::Ipv4Addr;
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;

use super::{
    ControlStore, Ipv4Net, Notifications, OwnerId, OwnerRow, ProfileId, StagingOutcome, Timestamp,
};
use crate::Mac;

const CHANNEL_DEPTH: usize = 16;

/// A per-relay configuration bundle as the operator enters it.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub relay_ip: Ipv4Addr,
    pub network_addr: Ipv4Net,
    pub router_ip: Option<Ipv4Addr>,
    pub dns_ips: Vec<Ipv4Addr>,
    pub ntp_ips: Vec<Ipv4Addr>,
    pub lease_time: Duration,
}

#[derive(Clone, Debug)]
struct ProfileRecord {
    id: ProfileId,
    profile: Profile,
}

#[derive(Clone, Debug)]
struct OwnerRecord {
    id: OwnerId,
    profile_id: ProfileId,
    mac_addr: Mac,
    ip_addr: Option<Ipv4Addr>,
    lease_date: Timestamp,
    modify_seq: u64,
}

#[derive(Default)]
struct Tables {
    profiles: Vec<ProfileRecord>,
    owners: Vec<OwnerRecord>,
    next_profile: ProfileId,
    next_owner: OwnerId,
    modify_seq: u64,
}

impl Tables {
    fn join(&self, owner: &OwnerRecord) -> Option<OwnerRow> {
        let profile = self
            .profiles
            .iter()
            .find(|record| record.id == owner.profile_id)?;

        Some(OwnerRow {
            id: owner.id,
            mac_addr: owner.mac_addr,
            ip_addr: owner.ip_addr,
            relay_ip: profile.profile.relay_ip,
            network_addr: profile.profile.network_addr,
            router_ip: profile.profile.router_ip,
            dns_ips: profile.profile.dns_ips.clone(),
            ntp_ips: profile.profile.ntp_ips.clone(),
            lease_time: profile.profile.lease_time,
        })
    }

    fn rows_by_modify_date(&self, profile: Option<ProfileId>) -> Vec<OwnerRow> {
        let mut records: Vec<&OwnerRecord> = self
            .owners
            .iter()
            .filter(|record| profile.map(|id| record.profile_id == id).unwrap_or(true))
            .collect();

        records.sort_by_key(|record| record.modify_seq);

        records
            .into_iter()
            .filter_map(|record| self.join(record))
            .collect()
    }
}

/// A constraint violation on the operator surface.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemError {
    DuplicateName,
    DuplicateRelay,
    DuplicateIp,
    UnknownOwner,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName => write!(f, "Profile name already in use"),
            Self::DuplicateRelay => write!(f, "Relay address already in use"),
            Self::DuplicateIp => write!(f, "IP address already assigned in this profile"),
            Self::UnknownOwner => write!(f, "No such owner"),
        }
    }
}

impl std::error::Error for MemError {}

/// The shared store handle. [`ControlStore`] is implemented for `&MemStore`,
/// so the reconciler and the test driver can work against the same instance.
pub struct MemStore<M>
where
    M: RawMutex,
{
    tables: Mutex<M, RefCell<Tables>>,
    events: Channel<M, Option<String>, CHANNEL_DEPTH>,
}

impl<M> MemStore<M>
where
    M: RawMutex,
{
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(RefCell::new(Tables::default())),
            events: Channel::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        self.tables.lock(|tables| f(&mut tables.borrow_mut()))
    }

    pub fn add_profile(&self, profile: Profile) -> Result<ProfileId, MemError> {
        self.with(|tables| {
            if tables
                .profiles
                .iter()
                .any(|record| record.profile.name == profile.name)
            {
                Err(MemError::DuplicateName)?;
            }

            if tables
                .profiles
                .iter()
                .any(|record| record.profile.relay_ip == profile.relay_ip)
            {
                Err(MemError::DuplicateRelay)?;
            }

            tables.next_profile += 1;
            let id = tables.next_profile;
            tables.profiles.push(ProfileRecord { id, profile });

            Ok(id)
        })
    }

    /// Deletes a profile; its owner rows go with it.
    pub fn remove_profile(&self, profile: ProfileId) -> bool {
        self.with(|tables| {
            let before = tables.profiles.len();
            tables.profiles.retain(|record| record.id != profile);
            tables.owners.retain(|record| record.profile_id != profile);

            tables.profiles.len() != before
        })
    }

    pub fn update_profile(&self, profile: ProfileId, f: impl FnOnce(&mut Profile)) -> bool {
        self.with(|tables| {
            match tables
                .profiles
                .iter_mut()
                .find(|record| record.id == profile)
            {
                Some(record) => {
                    f(&mut record.profile);
                    true
                }
                None => false,
            }
        })
    }

    /// The operator assignment: sets (or clears) the owner's address and
    /// bumps its modification sequence.
    pub fn assign_ip(&self, owner: OwnerId, ip_addr: Option<Ipv4Addr>) -> Result<(), MemError> {
        self.with(|tables| {
            let profile_id = tables
                .owners
                .iter()
                .find(|record| record.id == owner)
                .map(|record| record.profile_id)
                .ok_or(MemError::UnknownOwner)?;

            if let Some(ip_addr) = ip_addr {
                if tables.owners.iter().any(|record| {
                    record.id != owner
                        && record.profile_id == profile_id
                        && record.ip_addr == Some(ip_addr)
                }) {
                    Err(MemError::DuplicateIp)?;
                }
            }

            tables.modify_seq += 1;
            let seq = tables.modify_seq;

            for record in tables.owners.iter_mut() {
                if record.id == owner {
                    record.ip_addr = ip_addr;
                    record.modify_seq = seq;
                }
            }

            Ok(())
        })
    }

    pub fn remove_owner(&self, owner: OwnerId) -> bool {
        self.with(|tables| {
            let before = tables.owners.len();
            tables.owners.retain(|record| record.id != owner);

            tables.owners.len() != before
        })
    }

    /// Snapshot of the full owner projection, in modification order.
    pub fn owners(&self) -> Vec<OwnerRow> {
        self.with(|tables| tables.rows_by_modify_date(None))
    }

    pub fn find_owner(&self, mac: Mac) -> Option<OwnerRow> {
        self.with(|tables| {
            tables
                .owners
                .iter()
                .find(|record| record.mac_addr == mac)
                .and_then(|record| tables.join(record))
        })
    }

    pub fn lease_date(&self, owner: OwnerId) -> Option<Timestamp> {
        self.with(|tables| {
            tables
                .owners
                .iter()
                .find(|record| record.id == owner)
                .map(|record| record.lease_date)
        })
    }

    /// Publishes a payload on the notification channel.
    pub async fn notify(&self, payload: &str) {
        self.events.send(Some(payload.into())).await
    }

    /// Closes the notification channel; subscribers exit after draining.
    pub async fn close(&self) {
        self.events.send(None).await
    }

    pub fn subscriber(&self) -> MemEvents<'_, M> {
        MemEvents(self)
    }
}

impl<M> Default for MemStore<M>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ControlStore for &MemStore<M>
where
    M: RawMutex,
{
    type Error = Infallible;

    async fn load_owners(&mut self) -> Result<Vec<OwnerRow>, Self::Error> {
        Ok(self.with(|tables| tables.rows_by_modify_date(None)))
    }

    async fn create_staging(
        &mut self,
        at: Timestamp,
        mac: Mac,
        relay_ip: Ipv4Addr,
    ) -> Result<StagingOutcome, Self::Error> {
        Ok(self.with(|tables| {
            let profile_id = match tables
                .profiles
                .iter()
                .find(|record| record.profile.relay_ip == relay_ip)
            {
                Some(record) => record.id,
                None => return StagingOutcome::NoProfile,
            };

            if tables
                .owners
                .iter()
                .any(|record| record.profile_id == profile_id && record.mac_addr == mac)
            {
                return StagingOutcome::AlreadyPresent;
            }

            tables.next_owner += 1;
            tables.modify_seq += 1;

            let id = tables.next_owner;
            let modify_seq = tables.modify_seq;

            tables.owners.push(OwnerRecord {
                id,
                profile_id,
                mac_addr: mac,
                ip_addr: None,
                lease_date: at,
                modify_seq,
            });

            StagingOutcome::Created(id)
        }))
    }

    async fn touch_lease(&mut self, at: Timestamp, owner: OwnerId) -> Result<(), Self::Error> {
        self.with(|tables| {
            for record in tables.owners.iter_mut() {
                if record.id == owner {
                    record.lease_date = at;
                }
            }
        });

        Ok(())
    }

    async fn owner(&mut self, owner: OwnerId) -> Result<Option<OwnerRow>, Self::Error> {
        Ok(self.with(|tables| {
            tables
                .owners
                .iter()
                .find(|record| record.id == owner)
                .and_then(|record| tables.join(record))
        }))
    }

    async fn profile_owners(
        &mut self,
        profile: ProfileId,
    ) -> Result<Vec<OwnerRow>, Self::Error> {
        Ok(self.with(|tables| tables.rows_by_modify_date(Some(profile))))
    }
}

/// The subscriber half of the in-memory notification channel.
pub struct MemEvents<'a, M>(&'a MemStore<M>)
where
    M: RawMutex;

impl<M> Notifications for MemEvents<'_, M>
where
    M: RawMutex,
{
    type Error = Infallible;

    async fn recv(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.0.events.receive().await)
    }
}

#[cfg(test)]
mod test {
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;

    fn profile(name: &str, relay_ip: Ipv4Addr) -> Profile {
        Profile {
            name: name.into(),
            description: String::new(),
            relay_ip,
            network_addr: "192.168.7.0/24".parse().unwrap(),
            router_ip: None,
            dns_ips: Vec::new(),
            ntp_ips: Vec::new(),
            lease_time: Duration::from_secs(3600),
        }
    }

    fn mac(last: u8) -> Mac {
        Mac([0xde, 0x12, 0x44, 0x4c, 0xbb, last])
    }

    #[test]
    fn profile_constraints() {
        let store = MemStore::<NoopRawMutex>::new();

        store
            .add_profile(profile("office", Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        assert_eq!(
            store.add_profile(profile("office", Ipv4Addr::new(10, 0, 1, 1))),
            Err(MemError::DuplicateName)
        );
        assert_eq!(
            store.add_profile(profile("lab", Ipv4Addr::new(10, 0, 0, 1))),
            Err(MemError::DuplicateRelay)
        );
    }

    #[test]
    fn staging_and_uniqueness() {
        let store = MemStore::<NoopRawMutex>::new();
        store
            .add_profile(profile("office", Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        block_on(async {
            let mut handle = &store;

            let outcome = handle
                .create_staging(Timestamp(1), mac(1), Ipv4Addr::new(10, 0, 0, 1))
                .await
                .unwrap();
            assert!(matches!(outcome, StagingOutcome::Created(_)));

            let outcome = handle
                .create_staging(Timestamp(2), mac(1), Ipv4Addr::new(10, 0, 0, 1))
                .await
                .unwrap();
            assert_eq!(outcome, StagingOutcome::AlreadyPresent);

            let outcome = handle
                .create_staging(Timestamp(3), mac(2), Ipv4Addr::new(10, 0, 99, 1))
                .await
                .unwrap();
            assert_eq!(outcome, StagingOutcome::NoProfile);
        });

        assert_eq!(store.owners().len(), 1);
    }

    #[test]
    fn assignment_enforces_ip_uniqueness() {
        let store = MemStore::<NoopRawMutex>::new();
        store
            .add_profile(profile("office", Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        block_on(async {
            let mut handle = &store;
            for i in 1..=2 {
                handle
                    .create_staging(Timestamp(i as _), mac(i), Ipv4Addr::new(10, 0, 0, 1))
                    .await
                    .unwrap();
            }
        });

        let first = store.find_owner(mac(1)).unwrap();
        let second = store.find_owner(mac(2)).unwrap();

        store
            .assign_ip(first.id, Some(Ipv4Addr::new(192, 168, 7, 2)))
            .unwrap();
        assert_eq!(
            store.assign_ip(second.id, Some(Ipv4Addr::new(192, 168, 7, 2))),
            Err(MemError::DuplicateIp)
        );
    }

    #[test]
    fn load_is_ordered_by_modification() {
        let store = MemStore::<NoopRawMutex>::new();
        store
            .add_profile(profile("office", Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        block_on(async {
            let mut handle = &store;
            for i in 1..=3 {
                handle
                    .create_staging(Timestamp(i as _), mac(i), Ipv4Addr::new(10, 0, 0, 1))
                    .await
                    .unwrap();
            }
        });

        // Touching the first row moves it to the end of the load order
        let first = store.find_owner(mac(1)).unwrap();
        store
            .assign_ip(first.id, Some(Ipv4Addr::new(192, 168, 7, 2)))
            .unwrap();

        let rows = store.owners();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].mac_addr, mac(1));
    }

    #[test]
    fn profile_removal_cascades() {
        let store = MemStore::<NoopRawMutex>::new();
        let id = store
            .add_profile(profile("office", Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        block_on(async {
            let mut handle = &store;
            handle
                .create_staging(Timestamp(1), mac(1), Ipv4Addr::new(10, 0, 0, 1))
                .await
                .unwrap();
        });

        assert!(store.remove_profile(id));
        assert!(store.owners().is_empty());
    }

    #[test]
    fn notifications_flow_until_close() {
        let store = MemStore::<NoopRawMutex>::new();
        let mut events = store.subscriber();

        block_on(async {
            store.notify("RELOAD_ITEM 1").await;
            store.close().await;

            assert_eq!(events.recv().await.unwrap().as_deref(), Some("RELOAD_ITEM 1"));
            assert_eq!(events.recv().await.unwrap(), None);
        });
    }
}
