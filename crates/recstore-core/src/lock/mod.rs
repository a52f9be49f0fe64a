//! Locking
//!
//! Two independent layers:
//! - Transaction locks ([`LockClient`]): shared/exclusive locks on logical
//!   resources held by a transaction until it ends. Provided by
//!   [`manager::LockManager`] sessions, with deadlock detection.
//! - Record locks ([`service::LockService`]): short exclusive locks taken by
//!   the command applier while it writes records, grouped per batch in a
//!   [`service::LockGroup`].
//!
//! [`two_phase::TwoPhaseNodeForRelationshipLocking`] builds on the first
//! layer to lock a node together with every neighbour before its
//! relationships are deleted.

pub mod manager;
pub mod service;
pub mod two_phase;

pub use manager::{LockClientSession, LockManager, LockStats};
pub use service::{LockGroup, LockService, NoLockService, RecordLock, ReentrantLockService};
pub use two_phase::{
    Direction, LockRound, RelationshipItem, RelationshipTraversal,
    TwoPhaseNodeForRelationshipLocking,
};

use crate::Result;
use serde::{Deserialize, Serialize};

/// Resource type for locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Node resource
    Node,
    /// Relationship resource
    Relationship,
    /// Label token (taken shared by label writers, exclusive by schema changes)
    Label,
    /// Schema as a whole
    Schema,
    /// Hash of a (label, key, value) index entry
    IndexEntry,
    /// Named explicit index
    ExplicitIndex,
}

/// Resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type
    pub resource_type: ResourceType,
    /// Resource ID
    pub id: u64,
}

impl ResourceId {
    /// Create a resource id
    pub fn new(resource_type: ResourceType, id: u64) -> Self {
        Self { resource_type, id }
    }

    /// Create a new node resource ID
    pub fn node(id: u64) -> Self {
        Self::new(ResourceType::Node, id)
    }

    /// Create a new relationship resource ID
    pub fn relationship(id: u64) -> Self {
        Self::new(ResourceType::Relationship, id)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.resource_type, self.id)
    }
}

/// Observer of lock waits
pub trait LockTracer: Send + Sync {
    /// Called once when an acquisition has to wait
    fn wait_for_lock(&self, _exclusive: bool, _resource_type: ResourceType, _ids: &[u64]) {}
}

/// Tracer that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLockTracer;

impl LockTracer for NoLockTracer {}

/// Shared no-op tracer
pub static NO_TRACER: NoLockTracer = NoLockTracer;

/// Narrow locking capability handed to command creation
pub trait ResourceLocker {
    /// Acquire exclusive locks on `ids`, in the given order
    fn acquire_exclusive(&self, tracer: &dyn LockTracer, resource_type: ResourceType, ids: &[u64]) -> Result<()>;
}

/// Transaction-scoped lock client.
///
/// Multi-id calls acquire in the order given; on failure the locks taken by
/// that call are released before the error is returned. Locks are
/// re-entrant: every acquisition needs a matching release.
pub trait LockClient: ResourceLocker + Send + Sync {
    /// Acquire shared locks on `ids`
    fn acquire_shared(&self, tracer: &dyn LockTracer, resource_type: ResourceType, ids: &[u64]) -> Result<()>;

    /// Try to take an exclusive lock without waiting
    fn try_acquire_exclusive(&self, resource_type: ResourceType, id: u64) -> Result<bool>;

    /// Release one exclusive acquisition of each id
    fn release_exclusive(&self, resource_type: ResourceType, ids: &[u64]);

    /// Release one shared acquisition of each id
    fn release_shared(&self, resource_type: ResourceType, ids: &[u64]);

    /// Turn one exclusive acquisition into a shared one
    fn downgrade_to_shared(&self, resource_type: ResourceType, id: u64) -> Result<()>;

    /// Whether this client holds an exclusive lock on the resource
    fn holds_exclusive(&self, resource_type: ResourceType, id: u64) -> bool;

    /// Release everything this client holds
    fn release_all(&self);
}
