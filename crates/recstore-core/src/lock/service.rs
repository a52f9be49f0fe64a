//! Record locks taken while applying commands
//!
//! The applier locks a node record before writing it so concurrent readers
//! that also take the lock (index population) never see a half-applied
//! node. Locks are re-entrant per thread and released when the
//! [`RecordLock`] handle drops, normally when the batch's [`LockGroup`] closes.
//! Recovery runs single-threaded and uses [`NoLockService`].

use crate::lock::{ResourceId, ResourceType};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

/// Source of record locks
pub trait LockService: Send + Sync {
    /// Exclusively lock a node record
    fn acquire_node_lock(&self, node_id: u64) -> RecordLock;

    /// Exclusively lock a relationship record
    fn acquire_relationship_lock(&self, relationship_id: u64) -> RecordLock;
}

/// Handle on a record lock; dropping it releases the lock
pub struct RecordLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RecordLock {
    /// A lock that guards nothing
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for RecordLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLock")
            .field("held", &self.release.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LockOwners {
    owners: Mutex<HashMap<ResourceId, (ThreadId, u32)>>,
    released: Condvar,
}

impl LockOwners {
    fn lock(&self, resource: ResourceId) {
        let me = std::thread::current().id();
        let mut owners = self.owners.lock();
        loop {
            match owners.get_mut(&resource) {
                None => {
                    owners.insert(resource, (me, 1));
                    return;
                }
                Some((owner, count)) if *owner == me => {
                    *count += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut owners),
            }
        }
    }

    fn unlock(&self, resource: ResourceId) {
        let mut owners = self.owners.lock();
        let free = match owners.get_mut(&resource) {
            Some((_, count)) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if free {
            owners.remove(&resource);
            drop(owners);
            self.released.notify_all();
        }
    }
}

/// Per-record exclusive locks, re-entrant for the owning thread
#[derive(Debug, Clone, Default)]
pub struct ReentrantLockService {
    inner: Arc<LockOwners>,
}

impl ReentrantLockService {
    /// Create a lock service
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, resource: ResourceId) -> RecordLock {
        self.inner.lock(resource);
        let inner = Arc::clone(&self.inner);
        RecordLock {
            release: Some(Box::new(move || inner.unlock(resource))),
        }
    }

    /// Number of records currently locked
    pub fn locked_count(&self) -> usize {
        self.inner.owners.lock().len()
    }
}

impl LockService for ReentrantLockService {
    fn acquire_node_lock(&self, node_id: u64) -> RecordLock {
        self.acquire(ResourceId::new(ResourceType::Node, node_id))
    }

    fn acquire_relationship_lock(&self, relationship_id: u64) -> RecordLock {
        self.acquire(ResourceId::new(ResourceType::Relationship, relationship_id))
    }
}

/// Lock service that never blocks, for single-threaded recovery
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLockService;

impl LockService for NoLockService {
    fn acquire_node_lock(&self, _node_id: u64) -> RecordLock {
        RecordLock::noop()
    }

    fn acquire_relationship_lock(&self, _relationship_id: u64) -> RecordLock {
        RecordLock::noop()
    }
}

/// Record locks held for the duration of one applied batch
#[derive(Debug, Default)]
pub struct LockGroup {
    locks: Mutex<Vec<RecordLock>>,
}

impl LockGroup {
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a lock until the group closes
    pub fn add(&self, lock: RecordLock) {
        self.locks.lock().push(lock);
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether the group holds no locks
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Release all locks in reverse acquisition order
    pub fn close(&self) {
        let mut locks = std::mem::take(&mut *self.locks.lock());
        while let Some(lock) = locks.pop() {
            lock.release();
        }
    }
}

impl Drop for LockGroup {
    fn drop(&mut self) {
        self.close();
    }
}
