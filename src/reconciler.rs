//! The reconciler: a single long-running consumer that owns all mutating
//! access to the control store and applies store state to the cache.
//!
//! Tasks arrive over a bounded FIFO queue. The data plane enqueues with
//! [`TaskQueue::offer`], which never blocks: a full queue drops the task with
//! a warning and the packet flow continues. The control plane (notification
//! subscriber, shutdown) uses [`TaskQueue::push`] and waits.
//!
//! A store error fails only the task in flight; it is logged and the loop
//! moves on. The one deliberate exception is the uniqueness violation on a
//! staging insert, which is reported as a regular outcome and swallowed, as
//! it only means that a concurrent request won the insert race.

use core::net::Ipv4Addr;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};

use log::{debug, info, warn};

use crate::cache::Cache;
use crate::store::{ControlStore, Notification, OwnerId, ProfileId, StagingOutcome, Timestamp};
use crate::Mac;

/// Default capacity of the task queue.
pub const QUEUE_DEPTH: usize = 1000;

/// A unit of reconciliation work.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Task {
    /// Break the loop and release the store connection. Queued tasks behind
    /// it are discarded.
    Shutdown,
    /// Re-run the full owner load.
    LoadOwners,
    /// Record an unknown MAC as a staging candidate.
    AddStaging {
        at: Timestamp,
        mac: Mac,
        relay_ip: Ipv4Addr,
    },
    /// Stamp the lease date after an ACK.
    UpdateLease { at: Timestamp, mac: Mac },
    /// Re-read one owner row and fold it into the cache.
    ReloadOwner(OwnerId),
    /// Re-read all owner rows of a profile and fold them into the cache.
    ReloadProfile(ProfileId),
    RemoveStaging(Mac),
    RemoveActive(Mac),
}

impl From<Notification> for Task {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::ReloadOwner(owner) => Self::ReloadOwner(owner),
            Notification::ReloadProfile(profile) => Self::ReloadProfile(profile),
            Notification::RemoveStaging(mac) => Self::RemoveStaging(mac),
            Notification::RemoveActive(mac) => Self::RemoveActive(mac),
        }
    }
}

/// The bounded FIFO queue feeding the reconciler.
pub struct TaskQueue<M, const N: usize = QUEUE_DEPTH>
where
    M: RawMutex,
{
    channel: Channel<M, Task, N>,
}

impl<M, const N: usize> TaskQueue<M, N>
where
    M: RawMutex,
{
    pub fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Non-blocking enqueue for the data plane. Returns whether the task was
    /// accepted; a full queue drops it.
    pub fn offer(&self, task: Task) -> bool {
        match self.channel.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                warn!("Task queue is full, dropping {task:?}");
                false
            }
        }
    }

    /// Enqueue for the control plane, waiting for a slot when the queue is
    /// full.
    pub async fn push(&self, task: Task) {
        self.channel.send(task).await
    }

    async fn next(&self) -> Task {
        self.channel.receive().await
    }
}

impl<M, const N: usize> Default for TaskQueue<M, N>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The single consumer of the task queue and the sole writer to the store
/// and (store-derived) to the cache.
pub struct Reconciler<'a, M, S, const N: usize = QUEUE_DEPTH>
where
    M: RawMutex,
{
    queue: &'a TaskQueue<M, N>,
    cache: &'a Cache<M>,
    store: S,
}

impl<'a, M, S, const N: usize> Reconciler<'a, M, S, N>
where
    M: RawMutex,
    S: ControlStore,
{
    pub fn new(queue: &'a TaskQueue<M, N>, cache: &'a Cache<M>, store: S) -> Self {
        Self {
            queue,
            cache,
            store,
        }
    }

    /// Seeds the cache with the full owner snapshot.
    ///
    /// Run to completion at startup, before any listener binds; errors here
    /// are fatal to initialization.
    pub async fn load(&mut self) -> Result<(), S::Error> {
        let rows = self.store.load_owners().await?;

        for row in &rows {
            self.cache.apply_row(row);
        }

        self.cache.with(|inner| {
            info!(
                "Loaded {} owner rows: {} active, {} staging",
                rows.len(),
                inner.active_len(),
                inner.staging_len()
            )
        });

        Ok(())
    }

    /// Drains the queue until a [`Task::Shutdown`] arrives, then drops the
    /// store connection.
    pub async fn run(mut self) {
        loop {
            let task = self.queue.next().await;
            debug!("Handling task: {task:?}");

            if matches!(task, Task::Shutdown) {
                break;
            }

            if let Err(err) = self.handle(task).await {
                warn!("Store operation failed, task lost: {err}");
            }
        }

        info!("Reconciler stopped");
    }

    async fn handle(&mut self, task: Task) -> Result<(), S::Error> {
        match task {
            Task::Shutdown => (),
            Task::LoadOwners => self.load().await?,
            Task::AddStaging { at, mac, relay_ip } => {
                match self.store.create_staging(at, mac, relay_ip).await? {
                    StagingOutcome::Created(owner) => {
                        debug!("Staged {mac} behind relay {relay_ip} as owner {owner}");
                    }
                    StagingOutcome::NoProfile => {
                        // Undo the optimistic mark, nothing will resolve it
                        self.cache.remove_staging(mac);
                        warn!("No profile for relay {relay_ip}");
                    }
                    StagingOutcome::AlreadyPresent => (),
                }
            }
            Task::UpdateLease { at, mac } => {
                let owner = self
                    .cache
                    .with(|inner| inner.active(mac).map(|entry| entry.owner_id));

                if let Some(owner) = owner {
                    self.store.touch_lease(at, owner).await?;
                }
            }
            Task::ReloadOwner(owner) => match self.store.owner(owner).await? {
                Some(row) => self.cache.apply_row(&row),
                None => debug!("Owner {owner} is gone, nothing to reload"),
            },
            Task::ReloadProfile(profile) => {
                for row in self.store.profile_owners(profile).await? {
                    self.cache.apply_row(&row);
                }
            }
            Task::RemoveStaging(mac) => {
                self.cache.remove_staging(mac);
            }
            Task::RemoveActive(mac) => {
                self.cache.remove_active(mac);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use core::net::Ipv4Addr;
    use core::time::Duration;

    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use crate::store::mem::{MemStore, Profile};

    use super::*;

    const RELAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn mac() -> Mac {
        "de:12:44:4c:bb:48".parse().unwrap()
    }

    fn store_with_profile() -> MemStore<NoopRawMutex> {
        let store = MemStore::new();

        store
            .add_profile(Profile {
                name: "office".into(),
                description: String::new(),
                relay_ip: RELAY,
                network_addr: "192.168.7.0/24".parse().unwrap(),
                router_ip: None,
                dns_ips: Vec::new(),
                ntp_ips: Vec::new(),
                lease_time: Duration::from_secs(3600),
            })
            .unwrap();

        store
    }

    fn drain<const N: usize>(
        queue: &TaskQueue<NoopRawMutex, N>,
        cache: &Cache<NoopRawMutex>,
        store: &MemStore<NoopRawMutex>,
    ) {
        queue.offer(Task::Shutdown);
        block_on(Reconciler::new(queue, cache, store).run());
    }

    #[test]
    fn staging_insert_and_race() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        let at = Timestamp(1000);

        // A burst of identical requests; at most one insert may succeed
        for _ in 0..3 {
            queue.offer(Task::AddStaging {
                at,
                mac: mac(),
                relay_ip: RELAY,
            });
        }
        cache.mark_staging(mac(), RELAY);

        drain(&queue, &cache, &store);

        let owners = store.owners();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].mac_addr, mac());
        assert_eq!(owners[0].ip_addr, None);
        assert!(cache.in_staging(mac()));
    }

    #[test]
    fn staging_without_profile_clears_mark() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        queue.offer(Task::AddStaging {
            at: Timestamp(1000),
            mac: mac(),
            relay_ip: Ipv4Addr::new(10, 99, 99, 1),
        });
        cache.mark_staging(mac(), Ipv4Addr::new(10, 99, 99, 1));

        drain(&queue, &cache, &store);

        assert!(store.owners().is_empty());
        assert!(!cache.in_staging(mac()));
    }

    #[test]
    fn reload_owner_transitions_to_active() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        queue.offer(Task::AddStaging {
            at: Timestamp(1000),
            mac: mac(),
            relay_ip: RELAY,
        });
        cache.mark_staging(mac(), RELAY);
        drain(&queue, &cache, &store);

        let owner = store.find_owner(mac()).unwrap();
        store
            .assign_ip(owner.id, Some(Ipv4Addr::new(192, 168, 7, 2)))
            .unwrap();

        queue.offer(Task::ReloadOwner(owner.id));
        drain(&queue, &cache, &store);

        assert!(!cache.in_staging(mac()));
        let entry = cache.lookup_active(mac()).unwrap();
        assert_eq!(entry.ip_addr, Ipv4Addr::new(192, 168, 7, 2));
        assert_eq!(entry.owner_id, owner.id);

        // Applying the same reload twice changes nothing
        queue.offer(Task::ReloadOwner(owner.id));
        drain(&queue, &cache, &store);
        assert_eq!(cache.lookup_active(mac()).unwrap(), entry);

        // No MAC is ever in both maps
        cache.with(|inner| {
            assert_eq!(inner.active_len(), 1);
            assert_eq!(inner.staging_len(), 0);
        });
    }

    #[test]
    fn update_lease_stamps_active_owner() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        queue.offer(Task::AddStaging {
            at: Timestamp(1000),
            mac: mac(),
            relay_ip: RELAY,
        });
        drain(&queue, &cache, &store);

        let owner = store.find_owner(mac()).unwrap();
        store
            .assign_ip(owner.id, Some(Ipv4Addr::new(192, 168, 7, 2)))
            .unwrap();
        queue.offer(Task::ReloadOwner(owner.id));
        drain(&queue, &cache, &store);

        queue.offer(Task::UpdateLease {
            at: Timestamp(2000),
            mac: mac(),
        });
        drain(&queue, &cache, &store);

        assert_eq!(store.lease_date(owner.id), Some(Timestamp(2000)));

        // A lease update for an unknown MAC is a no-op
        queue.offer(Task::UpdateLease {
            at: Timestamp(3000),
            mac: "00:00:00:00:00:01".parse().unwrap(),
        });
        drain(&queue, &cache, &store);
        assert_eq!(store.lease_date(owner.id), Some(Timestamp(2000)));
    }

    #[test]
    fn reload_of_vanished_owner_is_harmless() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        queue.offer(Task::ReloadOwner(4711));
        drain(&queue, &cache, &store);

        cache.with(|inner| {
            assert_eq!(inner.active_len(), 0);
            assert_eq!(inner.staging_len(), 0);
        });
    }

    #[test]
    fn full_queue_drops_tasks() {
        let queue: TaskQueue<NoopRawMutex, 2> = TaskQueue::new();

        assert!(queue.offer(Task::RemoveStaging(mac())));
        assert!(queue.offer(Task::RemoveStaging(mac())));
        assert!(!queue.offer(Task::RemoveStaging(mac())));
    }

    #[test]
    fn shutdown_discards_queued_tasks() {
        let store = store_with_profile();
        let cache = Cache::new();
        let queue: TaskQueue<NoopRawMutex> = TaskQueue::new();

        queue.offer(Task::Shutdown);
        queue.offer(Task::AddStaging {
            at: Timestamp(1000),
            mac: mac(),
            relay_ip: RELAY,
        });

        block_on(Reconciler::new(&queue, &cache, &store).run());

        assert!(store.owners().is_empty());
    }
}
