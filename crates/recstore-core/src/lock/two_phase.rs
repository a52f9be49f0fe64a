//! Two-phase locking of a node and all of its neighbours
//!
//! Deleting a node's relationships rewrites the relationship chains of every
//! neighbour, so all those nodes must be locked first. The neighbour set is
//! only known after traversing the chain, and the chain can change until the
//! locks are held. The locker therefore:
//!
//! 1. traverses without locks to guess the node set,
//! 2. locks the guess in ascending id order (a global order, so concurrent
//!    lockers can not deadlock on each other),
//! 3. traverses again under the locks; if a node outside the locked set
//!    shows up, releases this round's locks, grows the set and goes to 2.
//!
//! Only a stable round hands relationship ids to the consumer. Nothing bounds
//! the number of rounds; every retry strictly grows the set.

use crate::lock::{LockClient, LockTracer, ResourceType};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Direction of a relationship as seen from the traversed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Traversed node is the start node
    Outgoing,
    /// Traversed node is the end node
    Incoming,
    /// Start and end are the traversed node
    Loop,
}

/// One relationship seen from a traversed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipItem {
    /// Relationship id
    pub id: u64,
    /// The other endpoint (the traversed node itself for a loop)
    pub other_node: u64,
    /// Relationship type id
    pub type_id: u32,
    /// Direction from the traversed node
    pub direction: Direction,
}

/// Cursor over the relationships of a node
pub trait RelationshipTraversal {
    /// Position the cursor on `node_id`'s relationships
    fn traverse(&mut self, node_id: u64) -> Result<()>;

    /// Next relationship, or None when the chain is exhausted
    fn next_relationship(&mut self) -> Result<Option<RelationshipItem>>;
}

/// Outcome of one locked traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRound {
    /// No new neighbour appeared; the locks stay held
    Stable {
        /// Locked node ids, ascending
        locked: Vec<u64>,
        /// Relationship ids seen under the locks, in traversal order
        relationships: Vec<u64>,
    },
    /// New neighbours appeared; this round's locks were released
    NeedsRetry {
        /// Node set for the next round, ascending
        next: Vec<u64>,
    },
}

struct Observed {
    nodes: BTreeSet<u64>,
    relationships: Vec<u64>,
}

fn traverse_all(node_id: u64, cursor: &mut dyn RelationshipTraversal) -> Result<Observed> {
    cursor.traverse(node_id)?;
    let mut nodes = BTreeSet::new();
    nodes.insert(node_id);
    let mut relationships = Vec::new();
    let mut seen = HashSet::new();
    while let Some(item) = cursor.next_relationship()? {
        nodes.insert(item.other_node);
        if seen.insert(item.id) {
            relationships.push(item.id);
        }
    }
    Ok(Observed {
        nodes,
        relationships,
    })
}

/// Locks a node and every neighbour, then feeds the relationship ids to a consumer
pub struct TwoPhaseNodeForRelationshipLocking<'a, F>
where
    F: FnMut(u64) -> Result<()>,
{
    consumer: F,
    locks: &'a dyn LockClient,
    tracer: &'a dyn LockTracer,
}

impl<'a, F> TwoPhaseNodeForRelationshipLocking<'a, F>
where
    F: FnMut(u64) -> Result<()>,
{
    /// Create a locker that reports relationship ids to `consumer`
    pub fn new(consumer: F, locks: &'a dyn LockClient, tracer: &'a dyn LockTracer) -> Self {
        Self {
            consumer,
            locks,
            tracer,
        }
    }

    /// Lock `node_id` and its neighbours, then call the consumer once per relationship.
    ///
    /// On success the node locks stay held by the lock client and the locked
    /// ids are returned. On error the current round's locks are released.
    pub fn lock_all_nodes_and_consume_relationships(
        &mut self,
        node_id: u64,
        cursor: &mut dyn RelationshipTraversal,
    ) -> Result<Vec<u64>> {
        let mut working = traverse_all(node_id, cursor)?.nodes;

        loop {
            match self.lock_round(node_id, &working, cursor)? {
                LockRound::Stable {
                    locked,
                    relationships,
                } => {
                    for relationship in relationships {
                        if let Err(e) = (self.consumer)(relationship) {
                            self.locks.release_exclusive(ResourceType::Node, &locked);
                            return Err(e);
                        }
                    }
                    return Ok(locked);
                }
                LockRound::NeedsRetry { next } => {
                    tracing::debug!(
                        "Relationship chain of node {} changed while locking; retrying with {} nodes",
                        node_id,
                        next.len()
                    );
                    working = next.into_iter().collect();
                }
            }
        }
    }

    /// Lock `working` in ascending order and re-traverse under the locks
    pub fn lock_round(
        &self,
        node_id: u64,
        working: &BTreeSet<u64>,
        cursor: &mut dyn RelationshipTraversal,
    ) -> Result<LockRound> {
        let sorted: Vec<u64> = working.iter().copied().collect();
        self.locks
            .acquire_exclusive(self.tracer, ResourceType::Node, &sorted)?;

        let observed = match traverse_all(node_id, cursor) {
            Ok(observed) => observed,
            Err(e) => {
                self.locks.release_exclusive(ResourceType::Node, &sorted);
                return Err(e);
            }
        };

        if observed.nodes.is_subset(working) {
            return Ok(LockRound::Stable {
                locked: sorted,
                relationships: observed.relationships,
            });
        }

        self.locks.release_exclusive(ResourceType::Node, &sorted);
        let next = working.union(&observed.nodes).copied().collect();
        Ok(LockRound::NeedsRetry { next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{NO_TRACER, ResourceLocker};
    use crate::Error;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Acquire(Vec<u64>),
        Release(Vec<u64>),
    }

    #[derive(Default)]
    struct RecordingLocks {
        calls: Mutex<Vec<Call>>,
    }

    impl ResourceLocker for RecordingLocks {
        fn acquire_exclusive(&self, _: &dyn LockTracer, _: ResourceType, ids: &[u64]) -> Result<()> {
            self.calls.lock().push(Call::Acquire(ids.to_vec()));
            Ok(())
        }
    }

    impl LockClient for RecordingLocks {
        fn acquire_shared(&self, _: &dyn LockTracer, _: ResourceType, _: &[u64]) -> Result<()> {
            unreachable!()
        }
        fn try_acquire_exclusive(&self, _: ResourceType, _: u64) -> Result<bool> {
            unreachable!()
        }
        fn release_exclusive(&self, _: ResourceType, ids: &[u64]) {
            self.calls.lock().push(Call::Release(ids.to_vec()));
        }
        fn release_shared(&self, _: ResourceType, _: &[u64]) {
            unreachable!()
        }
        fn downgrade_to_shared(&self, _: ResourceType, _: u64) -> Result<()> {
            unreachable!()
        }
        fn holds_exclusive(&self, _: ResourceType, _: u64) -> bool {
            false
        }
        fn release_all(&self) {}
    }

    struct FailingCursor {
        calls: usize,
    }

    impl RelationshipTraversal for FailingCursor {
        fn traverse(&mut self, node_id: u64) -> Result<()> {
            self.calls += 1;
            if self.calls > 1 {
                return Err(Error::not_found(format!("node {}", node_id)));
            }
            Ok(())
        }
        fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
            Ok(None)
        }
    }

    #[test]
    fn test_cursor_failure_releases_round_locks() {
        let locks = RecordingLocks::default();
        let mut locking = TwoPhaseNodeForRelationshipLocking::new(|_| Ok(()), &locks, &NO_TRACER);
        let mut cursor = FailingCursor { calls: 0 };

        let err = locking
            .lock_all_nodes_and_consume_relationships(9, &mut cursor)
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)));
        assert_eq!(
            *locks.calls.lock(),
            vec![Call::Acquire(vec![9]), Call::Release(vec![9])]
        );
    }

    #[test]
    fn test_lock_round_reports_retry_set() {
        struct Fixed(Vec<RelationshipItem>, usize);
        impl RelationshipTraversal for Fixed {
            fn traverse(&mut self, _: u64) -> Result<()> {
                self.1 = 0;
                Ok(())
            }
            fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
                let item = self.0.get(self.1).copied();
                self.1 += 1;
                Ok(item)
            }
        }

        let locks = RecordingLocks::default();
        let locking = TwoPhaseNodeForRelationshipLocking::new(|_| Ok(()), &locks, &NO_TRACER);
        let mut cursor = Fixed(
            vec![RelationshipItem {
                id: 1,
                other_node: 5,
                type_id: 0,
                direction: Direction::Outgoing,
            }],
            0,
        );

        let working: BTreeSet<u64> = [2].into_iter().collect();
        let round = locking.lock_round(2, &working, &mut cursor).unwrap();
        assert_eq!(round, LockRound::NeedsRetry { next: vec![2, 5] });
        assert_eq!(
            *locks.calls.lock(),
            vec![Call::Acquire(vec![2]), Call::Release(vec![2])]
        );
    }

    #[test]
    fn test_consumer_failure_releases_locks() {
        let locks = RecordingLocks::default();
        let mut locking = TwoPhaseNodeForRelationshipLocking::new(
            |_| Err(Error::internal("consumer refused")),
            &locks,
            &NO_TRACER,
        );
        struct One(bool);
        impl RelationshipTraversal for One {
            fn traverse(&mut self, _: u64) -> Result<()> {
                self.0 = false;
                Ok(())
            }
            fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
                if self.0 {
                    return Ok(None);
                }
                self.0 = true;
                Ok(Some(RelationshipItem {
                    id: 3,
                    other_node: 1,
                    type_id: 0,
                    direction: Direction::Loop,
                }))
            }
        }

        let result = locking.lock_all_nodes_and_consume_relationships(1, &mut One(false));
        assert!(result.is_err());
        assert_eq!(
            *locks.calls.lock(),
            vec![Call::Acquire(vec![1]), Call::Release(vec![1])]
        );
    }
}
