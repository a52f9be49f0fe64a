//! Transaction lock manager with wait-for-graph deadlock detection
//!
//! Each transaction talks to the manager through a [`LockClientSession`].
//! A waiting request records which resource its client waits for; before
//! blocking, the requester walks the wait-for graph from the holders of that
//! resource. Reaching itself means the wait would never end, so the request
//! fails with [`Error::Deadlock`] instead.

use crate::lock::{LockClient, LockTracer, ResourceId, ResourceLocker, ResourceType};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

type ClientId = u64;

/// Holders of one resource
#[derive(Debug, Default)]
struct ResourceLock {
    exclusive: Option<(ClientId, u32)>,
    shared: HashMap<ClientId, u32>,
}

impl ResourceLock {
    fn can_grant(&self, client: ClientId, exclusive: bool) -> bool {
        if let Some((owner, _)) = self.exclusive {
            if owner != client {
                return false;
            }
        }
        !exclusive || self.shared.keys().all(|holder| *holder == client)
    }

    fn grant(&mut self, client: ClientId, exclusive: bool) {
        if exclusive {
            match &mut self.exclusive {
                Some((_, count)) => *count += 1,
                None => self.exclusive = Some((client, 1)),
            }
        } else {
            *self.shared.entry(client).or_default() += 1;
        }
    }

    fn release(&mut self, client: ClientId, exclusive: bool) -> bool {
        if exclusive {
            match &mut self.exclusive {
                Some((owner, count)) if *owner == client => {
                    *count -= 1;
                    if *count == 0 {
                        self.exclusive = None;
                    }
                    true
                }
                _ => false,
            }
        } else {
            match self.shared.get_mut(&client) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&client);
                    }
                    true
                }
                None => false,
            }
        }
    }

    fn release_client(&mut self, client: ClientId) {
        if matches!(self.exclusive, Some((owner, _)) if owner == client) {
            self.exclusive = None;
        }
        self.shared.remove(&client);
    }

    fn holds_exclusive(&self, client: ClientId) -> bool {
        matches!(self.exclusive, Some((owner, _)) if owner == client)
    }

    fn holders_except(&self, client: ClientId) -> Vec<ClientId> {
        let mut holders: Vec<ClientId> = self
            .shared
            .keys()
            .copied()
            .chain(self.exclusive.map(|(owner, _)| owner))
            .filter(|holder| *holder != client)
            .collect();
        holders.sort_unstable();
        holders.dedup();
        holders
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<ResourceId, ResourceLock>,
    waiting_for: HashMap<ClientId, ResourceId>,
}

impl LockTable {
    /// Clients on a wait-for path from the holders of `resource` back to `client`
    fn deadlock_cycle(&self, client: ClientId, resource: ResourceId) -> Option<Vec<ClientId>> {
        let start = self.locks.get(&resource)?.holders_except(client);
        let mut stack: Vec<(ClientId, Vec<ClientId>)> =
            start.into_iter().map(|holder| (holder, vec![holder])).collect();
        let mut visited = HashSet::new();

        while let Some((holder, path)) = stack.pop() {
            if holder == client {
                return Some(path);
            }
            if !visited.insert(holder) {
                continue;
            }
            let Some(waiting) = self.waiting_for.get(&holder) else {
                continue;
            };
            if let Some(lock) = self.locks.get(waiting) {
                for next in lock.holders_except(holder) {
                    let mut next_path = path.clone();
                    next_path.push(next);
                    stack.push((next, next_path));
                }
            }
        }
        None
    }

    fn remove_if_free(&mut self, resource: ResourceId) {
        if self.locks.get(&resource).is_some_and(|lock| lock.is_free()) {
            self.locks.remove(&resource);
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Number of resources with at least one holder
    pub total_resources: usize,
    /// Number of shared holds (clients, not acquisitions)
    pub shared_holds: usize,
    /// Number of exclusive holds
    pub exclusive_holds: usize,
    /// Number of clients currently waiting
    pub waiting_clients: usize,
}

/// Shared/exclusive lock manager for transactions
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    next_client: AtomicU64,
    timeout: Duration,
}

impl LockManager {
    /// Create a lock manager whose acquisitions give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            next_client: AtomicU64::new(1),
            timeout,
        }
    }

    /// Open a new client session
    pub fn new_client(self: &Arc<Self>) -> LockClientSession {
        LockClientSession {
            manager: Arc::clone(self),
            id: self.next_client.fetch_add(1, Ordering::SeqCst),
            touched: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(
        &self,
        client: ClientId,
        resource: ResourceId,
        exclusive: bool,
        tracer: &dyn LockTracer,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        let mut traced = false;

        loop {
            let lock = table.locks.entry(resource).or_default();
            if lock.can_grant(client, exclusive) {
                lock.grant(client, exclusive);
                table.waiting_for.remove(&client);
                return Ok(());
            }

            if let Some(cycle) = table.deadlock_cycle(client, resource) {
                table.waiting_for.remove(&client);
                tracing::debug!(
                    "Deadlock: client {} requesting {} waits on clients {:?}",
                    client,
                    resource,
                    cycle
                );
                return Err(Error::Deadlock(format!(
                    "client {} can not acquire {} lock on {}: waiting would close a cycle through clients {:?}",
                    client,
                    if exclusive { "exclusive" } else { "shared" },
                    resource,
                    cycle
                )));
            }

            if !traced {
                tracer.wait_for_lock(exclusive, resource.resource_type, &[resource.id]);
                traced = true;
            }
            table.waiting_for.insert(client, resource);

            if self.released.wait_until(&mut table, deadline).timed_out() {
                let lock = table.locks.entry(resource).or_default();
                if lock.can_grant(client, exclusive) {
                    lock.grant(client, exclusive);
                    table.waiting_for.remove(&client);
                    return Ok(());
                }
                table.waiting_for.remove(&client);
                return Err(Error::LockTimeout(format!(
                    "client {} could not acquire {} lock on {} within {:?}",
                    client,
                    if exclusive { "exclusive" } else { "shared" },
                    resource,
                    self.timeout
                )));
            }
        }
    }

    fn try_acquire(&self, client: ClientId, resource: ResourceId, exclusive: bool) -> bool {
        let mut table = self.table.lock();
        let lock = table.locks.entry(resource).or_default();
        if lock.can_grant(client, exclusive) {
            lock.grant(client, exclusive);
            true
        } else {
            false
        }
    }

    fn release(&self, client: ClientId, resource: ResourceId, exclusive: bool) -> bool {
        let mut table = self.table.lock();
        let released = table
            .locks
            .get_mut(&resource)
            .is_some_and(|lock| lock.release(client, exclusive));
        table.remove_if_free(resource);
        drop(table);
        if released {
            self.released.notify_all();
        }
        released
    }

    fn downgrade(&self, client: ClientId, resource: ResourceId) -> Result<()> {
        let mut table = self.table.lock();
        let lock = table
            .locks
            .get_mut(&resource)
            .filter(|lock| lock.holds_exclusive(client))
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "client {} does not hold an exclusive lock on {}",
                    client, resource
                ))
            })?;
        lock.grant(client, false);
        lock.release(client, true);
        drop(table);
        self.released.notify_all();
        Ok(())
    }

    fn holds_exclusive(&self, client: ClientId, resource: ResourceId) -> bool {
        self.table
            .lock()
            .locks
            .get(&resource)
            .is_some_and(|lock| lock.holds_exclusive(client))
    }

    fn release_client(&self, client: ClientId, resources: impl IntoIterator<Item = ResourceId>) {
        let mut table = self.table.lock();
        for resource in resources {
            if let Some(lock) = table.locks.get_mut(&resource) {
                lock.release_client(client);
            }
            table.remove_if_free(resource);
        }
        table.waiting_for.remove(&client);
        drop(table);
        self.released.notify_all();
    }

    /// Get lock statistics
    pub fn stats(&self) -> LockStats {
        let table = self.table.lock();
        LockStats {
            total_resources: table.locks.values().filter(|l| !l.is_free()).count(),
            shared_holds: table.locks.values().map(|l| l.shared.len()).sum(),
            exclusive_holds: table.locks.values().filter(|l| l.exclusive.is_some()).count(),
            waiting_clients: table.waiting_for.len(),
        }
    }
}

/// A transaction's handle on the lock manager; releases everything on drop
#[derive(Debug)]
pub struct LockClientSession {
    manager: Arc<LockManager>,
    id: ClientId,
    touched: Mutex<HashSet<ResourceId>>,
}

impl LockClientSession {
    /// Client id
    pub fn id(&self) -> u64 {
        self.id
    }

    fn acquire_all(
        &self,
        tracer: &dyn LockTracer,
        resource_type: ResourceType,
        ids: &[u64],
        exclusive: bool,
    ) -> Result<()> {
        let mut acquired = Vec::with_capacity(ids.len());
        for id in ids {
            let resource = ResourceId::new(resource_type, *id);
            if let Err(e) = self.manager.acquire(self.id, resource, exclusive, tracer) {
                for taken in acquired.iter().rev() {
                    self.manager.release(self.id, *taken, exclusive);
                }
                return Err(e);
            }
            self.touched.lock().insert(resource);
            acquired.push(resource);
        }
        Ok(())
    }
}

impl ResourceLocker for LockClientSession {
    fn acquire_exclusive(&self, tracer: &dyn LockTracer, resource_type: ResourceType, ids: &[u64]) -> Result<()> {
        self.acquire_all(tracer, resource_type, ids, true)
    }
}

impl LockClient for LockClientSession {
    fn acquire_shared(&self, tracer: &dyn LockTracer, resource_type: ResourceType, ids: &[u64]) -> Result<()> {
        self.acquire_all(tracer, resource_type, ids, false)
    }

    fn try_acquire_exclusive(&self, resource_type: ResourceType, id: u64) -> Result<bool> {
        let resource = ResourceId::new(resource_type, id);
        let acquired = self.manager.try_acquire(self.id, resource, true);
        if acquired {
            self.touched.lock().insert(resource);
        }
        Ok(acquired)
    }

    fn release_exclusive(&self, resource_type: ResourceType, ids: &[u64]) {
        for id in ids {
            self.manager.release(self.id, ResourceId::new(resource_type, *id), true);
        }
    }

    fn release_shared(&self, resource_type: ResourceType, ids: &[u64]) {
        for id in ids {
            self.manager.release(self.id, ResourceId::new(resource_type, *id), false);
        }
    }

    fn downgrade_to_shared(&self, resource_type: ResourceType, id: u64) -> Result<()> {
        self.manager.downgrade(self.id, ResourceId::new(resource_type, id))
    }

    fn holds_exclusive(&self, resource_type: ResourceType, id: u64) -> bool {
        self.manager.holds_exclusive(self.id, ResourceId::new(resource_type, id))
    }

    fn release_all(&self) {
        let touched: Vec<ResourceId> = self.touched.lock().drain().collect();
        if !touched.is_empty() {
            self.manager.release_client(self.id, touched);
        }
    }
}

impl Drop for LockClientSession {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NO_TRACER;

    fn manager(timeout_ms: u64) -> Arc<LockManager> {
        Arc::new(LockManager::new(Duration::from_millis(timeout_ms)))
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let manager = manager(100);
        let a = manager.new_client();
        let b = manager.new_client();

        a.acquire_shared(&NO_TRACER, ResourceType::Node, &[1]).unwrap();
        b.acquire_shared(&NO_TRACER, ResourceType::Node, &[1]).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_resources, 1);
        assert_eq!(stats.shared_holds, 2);
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let manager = manager(50);
        let a = manager.new_client();
        let b = manager.new_client();

        a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1]).unwrap();
        let err = b.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1]).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_reentrant_exclusive_needs_matching_releases() {
        let manager = manager(50);
        let a = manager.new_client();
        let b = manager.new_client();

        a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[7]).unwrap();
        a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[7]).unwrap();
        a.release_exclusive(ResourceType::Node, &[7]);
        assert!(a.holds_exclusive(ResourceType::Node, 7));
        assert!(!b.try_acquire_exclusive(ResourceType::Node, 7).unwrap());

        a.release_exclusive(ResourceType::Node, &[7]);
        assert!(!a.holds_exclusive(ResourceType::Node, 7));
        assert!(b.try_acquire_exclusive(ResourceType::Node, 7).unwrap());
    }

    #[test]
    fn test_upgrade_when_sole_shared_holder() {
        let manager = manager(50);
        let a = manager.new_client();
        a.acquire_shared(&NO_TRACER, ResourceType::Label, &[1]).unwrap();
        a.acquire_exclusive(&NO_TRACER, ResourceType::Label, &[1]).unwrap();
        assert!(a.holds_exclusive(ResourceType::Label, 1));
    }

    #[test]
    fn test_downgrade_lets_readers_in() {
        let manager = manager(50);
        let a = manager.new_client();
        let b = manager.new_client();

        a.acquire_exclusive(&NO_TRACER, ResourceType::Schema, &[0]).unwrap();
        a.downgrade_to_shared(ResourceType::Schema, 0).unwrap();
        b.acquire_shared(&NO_TRACER, ResourceType::Schema, &[0]).unwrap();
        assert!(a.downgrade_to_shared(ResourceType::Schema, 0).is_err());
    }

    #[test]
    fn test_partial_failure_releases_acquired_in_call() {
        let manager = manager(30);
        let a = manager.new_client();
        let b = manager.new_client();

        b.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[3]).unwrap();
        let result = a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1, 2, 3]);
        assert!(result.is_err());
        assert!(!a.holds_exclusive(ResourceType::Node, 1));
        assert!(!a.holds_exclusive(ResourceType::Node, 2));
        assert!(b.try_acquire_exclusive(ResourceType::Node, 1).unwrap());
    }

    #[test]
    fn test_drop_releases_everything() {
        let manager = manager(50);
        {
            let a = manager.new_client();
            a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1, 2]).unwrap();
            a.acquire_shared(&NO_TRACER, ResourceType::Label, &[0]).unwrap();
            assert_eq!(manager.stats().total_resources, 3);
        }
        assert_eq!(manager.stats(), LockStats::default());
    }

    #[test]
    fn test_upgrade_deadlock_detected() {
        let manager = manager(2_000);
        let a = manager.new_client();
        let b = manager.new_client();
        a.acquire_shared(&NO_TRACER, ResourceType::Node, &[1]).unwrap();
        b.acquire_shared(&NO_TRACER, ResourceType::Node, &[1]).unwrap();

        let waiter = std::thread::spawn(move || {
            let result = a.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1]);
            (a, result)
        });

        // Let `a` start waiting before `b` closes the cycle.
        while manager.stats().waiting_clients == 0 {
            std::thread::yield_now();
        }
        let err = b.acquire_exclusive(&NO_TRACER, ResourceType::Node, &[1]).unwrap_err();
        assert!(matches!(err, Error::Deadlock(_)));

        drop(b);
        let (_a, result) = waiter.join().unwrap();
        assert!(result.is_ok());
    }
}
