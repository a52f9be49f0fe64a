//! Tests for two-phase locking of a node and its neighbours
//!
//! Scripted cursors stand in for the relationship store so that the exact
//! lock calls can be checked, including a chain that grows between the
//! unlocked and the locked traversal. The last tests run the locker through
//! real transactions.

use parking_lot::Mutex;
use recstore_core::lock::{
    Direction, LockClient, LockTracer, NO_TRACER, RelationshipItem, RelationshipTraversal,
    ResourceLocker, ResourceType, TwoPhaseNodeForRelationshipLocking,
};
use recstore_core::storage::counts::ANY;
use recstore_core::testing::setup_test_database;
use recstore_core::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockCall {
    Acquire(ResourceType, Vec<u64>),
    Release(ResourceType, Vec<u64>),
}

#[derive(Default)]
struct RecordingLockClient {
    calls: Mutex<Vec<LockCall>>,
}

impl RecordingLockClient {
    fn calls(&self) -> Vec<LockCall> {
        self.calls.lock().clone()
    }
}

impl ResourceLocker for RecordingLockClient {
    fn acquire_exclusive(&self, _tracer: &dyn LockTracer, resource_type: ResourceType, ids: &[u64]) -> Result<()> {
        self.calls
            .lock()
            .push(LockCall::Acquire(resource_type, ids.to_vec()));
        Ok(())
    }
}

impl LockClient for RecordingLockClient {
    fn acquire_shared(&self, _tracer: &dyn LockTracer, _resource_type: ResourceType, _ids: &[u64]) -> Result<()> {
        Ok(())
    }

    fn try_acquire_exclusive(&self, _resource_type: ResourceType, _id: u64) -> Result<bool> {
        Ok(true)
    }

    fn release_exclusive(&self, resource_type: ResourceType, ids: &[u64]) {
        self.calls
            .lock()
            .push(LockCall::Release(resource_type, ids.to_vec()));
    }

    fn release_shared(&self, _resource_type: ResourceType, _ids: &[u64]) {}

    fn downgrade_to_shared(&self, _resource_type: ResourceType, _id: u64) -> Result<()> {
        Ok(())
    }

    fn holds_exclusive(&self, _resource_type: ResourceType, _id: u64) -> bool {
        false
    }

    fn release_all(&self) {}
}

/// Cursor replaying one script per `traverse` call; the last script repeats
struct ScriptedCursor {
    scripts: Vec<Vec<RelationshipItem>>,
    traversals: usize,
    current: Vec<RelationshipItem>,
    position: usize,
}

impl ScriptedCursor {
    fn new(scripts: Vec<Vec<RelationshipItem>>) -> Self {
        Self {
            scripts,
            traversals: 0,
            current: Vec::new(),
            position: 0,
        }
    }

    fn fixed(items: Vec<RelationshipItem>) -> Self {
        Self::new(vec![items])
    }
}

impl RelationshipTraversal for ScriptedCursor {
    fn traverse(&mut self, _node_id: u64) -> Result<()> {
        let index = self.traversals.min(self.scripts.len() - 1);
        self.current = self.scripts[index].clone();
        self.traversals += 1;
        self.position = 0;
        Ok(())
    }

    fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
        let item = self.current.get(self.position).copied();
        self.position += 1;
        Ok(item)
    }
}

fn rel(id: u64, other_node: u64) -> RelationshipItem {
    RelationshipItem {
        id,
        other_node,
        type_id: 0,
        direction: Direction::Outgoing,
    }
}

fn lock_and_collect(
    node: u64,
    locks: &RecordingLockClient,
    cursor: &mut ScriptedCursor,
) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut seen = Vec::new();
    let locked = {
        let mut locking = TwoPhaseNodeForRelationshipLocking::new(
            |id| {
                seen.push(id);
                Ok(())
            },
            locks,
            &NO_TRACER,
        );
        locking.lock_all_nodes_and_consume_relationships(node, cursor)?
    };
    Ok((locked, seen))
}

#[test]
fn test_locks_node_and_neighbours_in_ascending_order() {
    let locks = RecordingLockClient::default();
    let mut cursor = ScriptedCursor::fixed(vec![
        rel(21, 43),
        rel(22, 41),
        rel(23, 40),
        rel(2, 49),
        rel(3, 3),
        RelationshipItem {
            id: 50,
            other_node: 42,
            type_id: 0,
            direction: Direction::Loop,
        },
    ]);

    let (locked, seen) = lock_and_collect(42, &locks, &mut cursor).unwrap();

    assert_eq!(locked, vec![3, 40, 41, 42, 43, 49]);
    assert_eq!(seen, vec![21, 22, 23, 2, 3, 50]);
    assert_eq!(
        locks.calls(),
        vec![LockCall::Acquire(ResourceType::Node, vec![3, 40, 41, 42, 43, 49])]
    );
}

#[test]
fn test_neighbour_order_is_independent_of_chain_order() {
    let locks = RecordingLockClient::default();
    let mut cursor = ScriptedCursor::fixed(vec![rel(1, 43), rel(2, 40), rel(3, 41)]);

    let (locked, _) = lock_and_collect(42, &locks, &mut cursor).unwrap();

    assert_eq!(locked, vec![40, 41, 42, 43]);
    assert_eq!(
        locks.calls(),
        vec![LockCall::Acquire(ResourceType::Node, vec![40, 41, 42, 43])]
    );
}

#[test]
fn test_retries_when_chain_grows_under_locks() {
    let locks = RecordingLockClient::default();
    let before = vec![rel(1, 40), rel(2, 41)];
    let after = vec![rel(3, 43), rel(1, 40), rel(2, 41)];
    let mut cursor = ScriptedCursor::new(vec![before.clone(), after.clone(), after]);

    let (locked, seen) = lock_and_collect(42, &locks, &mut cursor).unwrap();

    assert_eq!(
        locks.calls(),
        vec![
            LockCall::Acquire(ResourceType::Node, vec![40, 41, 42]),
            LockCall::Release(ResourceType::Node, vec![40, 41, 42]),
            LockCall::Acquire(ResourceType::Node, vec![40, 41, 42, 43]),
        ]
    );
    assert_eq!(locked, vec![40, 41, 42, 43]);
    // only the stable traversal reaches the consumer
    assert_eq!(seen, vec![3, 1, 2]);
}

#[test]
fn test_shrinking_chain_needs_no_retry() {
    let locks = RecordingLockClient::default();
    let mut cursor = ScriptedCursor::new(vec![vec![rel(1, 40), rel(2, 41)], vec![rel(1, 40)]]);

    let (locked, seen) = lock_and_collect(42, &locks, &mut cursor).unwrap();

    assert_eq!(locked, vec![40, 41, 42]);
    assert_eq!(seen, vec![1]);
    assert_eq!(locks.calls().len(), 1);
}

#[test]
fn test_node_without_relationships_locks_only_itself() {
    let locks = RecordingLockClient::default();
    let mut cursor = ScriptedCursor::fixed(Vec::new());

    let (locked, seen) = lock_and_collect(42, &locks, &mut cursor).unwrap();

    assert_eq!(locked, vec![42]);
    assert!(seen.is_empty());
    assert_eq!(
        locks.calls(),
        vec![LockCall::Acquire(ResourceType::Node, vec![42])]
    );
}

#[test]
fn test_lock_failure_propagates_without_consuming() {
    struct Refusing;
    impl ResourceLocker for Refusing {
        fn acquire_exclusive(&self, _: &dyn LockTracer, _: ResourceType, _: &[u64]) -> Result<()> {
            Err(Error::LockTimeout("refused".to_string()))
        }
    }
    impl LockClient for Refusing {
        fn acquire_shared(&self, _: &dyn LockTracer, _: ResourceType, _: &[u64]) -> Result<()> {
            Ok(())
        }
        fn try_acquire_exclusive(&self, _: ResourceType, _: u64) -> Result<bool> {
            Ok(false)
        }
        fn release_exclusive(&self, _: ResourceType, _: &[u64]) {}
        fn release_shared(&self, _: ResourceType, _: &[u64]) {}
        fn downgrade_to_shared(&self, _: ResourceType, _: u64) -> Result<()> {
            Ok(())
        }
        fn holds_exclusive(&self, _: ResourceType, _: u64) -> bool {
            false
        }
        fn release_all(&self) {}
    }

    let mut consumed = 0;
    let mut cursor = ScriptedCursor::fixed(vec![rel(1, 2)]);
    let result = TwoPhaseNodeForRelationshipLocking::new(
        |_| {
            consumed += 1;
            Ok(())
        },
        &Refusing,
        &NO_TRACER,
    )
    .lock_all_nodes_and_consume_relationships(1, &mut cursor);

    assert!(matches!(result, Err(Error::LockTimeout(_))));
    assert_eq!(consumed, 0);
}

#[test]
fn test_detach_delete_removes_every_relationship() {
    let (db, _ctx) = setup_test_database().unwrap();
    let knows = db.relationship_type("KNOWS").unwrap();

    let mut tx = db.begin_tx().unwrap();
    let hub = tx.node_create().unwrap();
    let mut others = Vec::new();
    for _ in 0..5 {
        let other = tx.node_create().unwrap();
        tx.relationship_create(hub, knows, other).unwrap();
        others.push(other);
    }
    tx.relationship_create(others[0], knows, hub).unwrap();
    tx.relationship_create(hub, knows, hub).unwrap();
    tx.commit().unwrap();
    assert_eq!(db.new_reader().node_relationships(hub).unwrap().len(), 7);

    let mut tx = db.begin_tx().unwrap();
    assert_eq!(tx.node_detach_delete(hub).unwrap(), 7);
    tx.commit().unwrap();

    let reader = db.new_reader();
    assert!(reader.node(hub).unwrap().is_none());
    for other in others {
        assert!(reader.node(other).unwrap().is_some());
        assert!(reader.node_relationships(other).unwrap().is_empty());
    }
    assert_eq!(reader.count_relationships(ANY, ANY, ANY), 0);
}

#[test]
fn test_plain_delete_with_relationships_is_refused() {
    let (db, _ctx) = setup_test_database().unwrap();
    let knows = db.relationship_type("KNOWS").unwrap();

    let mut tx = db.begin_tx().unwrap();
    let a = tx.node_create().unwrap();
    let b = tx.node_create().unwrap();
    tx.relationship_create(a, knows, b).unwrap();
    tx.commit().unwrap();
    let last = db.last_committed_tx();

    let mut tx = db.begin_tx().unwrap();
    tx.node_delete(a).unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert_eq!(db.last_committed_tx(), last);
    assert!(db.new_reader().node(a).unwrap().is_some());
    assert!(db.health().is_healthy());
}

#[test]
fn test_detach_delete_waits_for_concurrent_relationship_creation() {
    let (db, _ctx) = setup_test_database().unwrap();
    let db = Arc::new(db);
    let knows = db.relationship_type("KNOWS").unwrap();

    let mut tx = db.begin_tx().unwrap();
    let hub = tx.node_create().unwrap();
    let first = tx.node_create().unwrap();
    let late = tx.node_create().unwrap();
    tx.relationship_create(hub, knows, first).unwrap();
    tx.commit().unwrap();

    // A writer holds `late` and `hub` while it adds a relationship.
    let mut writer = db.begin_tx().unwrap();
    writer.relationship_create(late, knows, hub).unwrap();

    let deleter = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || -> Result<usize> {
            let mut tx = db.begin_tx()?;
            let deleted = tx.node_detach_delete(hub)?;
            tx.commit()?;
            Ok(deleted)
        })
    };

    while db.lock_manager().stats().waiting_clients == 0 {
        std::thread::yield_now();
    }
    writer.commit().unwrap();

    assert_eq!(deleter.join().unwrap().unwrap(), 2);
    let reader = db.new_reader();
    assert!(reader.node(hub).unwrap().is_none());
    assert!(reader.node_relationships(late).unwrap().is_empty());
    assert!(reader.node_relationships(first).unwrap().is_empty());
}
