//! Tests for applying committed batches through the storage engine
//!
//! Batches are produced by a real database and replayed into a second engine
//! in the different application modes.

use recstore_core::apply::{TransactionApplicationMode, TransactionToApply};
use recstore_core::command::{Command, NodeCommand};
use recstore_core::health::HealthStatus;
use recstore_core::storage::{ANY, NodeRecord, PropertyValue, TokenKind};
use recstore_core::testing::{setup_test_database, setup_test_engine};
use recstore_core::Error;

struct Produced {
    batch: Vec<TransactionToApply>,
    label: u32,
    key: u32,
    node: u64,
}

/// Label token, property key token, then one labelled node with a property
fn produce_batch() -> Produced {
    let (db, _ctx) = setup_test_database().unwrap();
    let label = db.label("Person").unwrap();
    let key = db.property_key("name").unwrap();
    let mut tx = db.begin_tx().unwrap();
    let node = tx.node_create().unwrap();
    tx.node_add_label(node, label).unwrap();
    tx.node_set_property(node, key, PropertyValue::from("Ada")).unwrap();
    assert_eq!(tx.commit().unwrap(), Some(3));

    let batch = db
        .log()
        .read_entries_after(0)
        .unwrap()
        .into_iter()
        .map(TransactionToApply::from)
        .collect();
    Produced {
        batch,
        label,
        key,
        node,
    }
}

#[test]
fn test_external_apply_updates_every_store() {
    let produced = produce_batch();
    assert_eq!(produced.batch.len(), 3);

    let (engine, _ctx) = setup_test_engine().unwrap();
    engine
        .apply(&produced.batch, TransactionApplicationMode::External)
        .unwrap();

    let reader = engine.new_reader();
    assert_eq!(reader.node_labels(produced.node).unwrap(), vec![produced.label]);
    assert_eq!(
        reader.node_property(produced.node, produced.key).unwrap(),
        Some(PropertyValue::from("Ada"))
    );
    assert_eq!(reader.token_id(TokenKind::Label, "Person"), Some(produced.label));
    assert_eq!(reader.token_name(TokenKind::PropertyKey, produced.key), "name");
    assert_eq!(reader.count_nodes(produced.label), 1);
    assert_eq!(reader.count_nodes(ANY), 1);
    assert_eq!(reader.nodes_with_label(produced.label), vec![produced.node]);
    assert!(engine.stores().nodes().high_id() > produced.node);
}

#[test]
fn test_counts_applied_once_per_transaction() {
    let produced = produce_batch();
    let (engine, _ctx) = setup_test_engine().unwrap();
    engine
        .apply(&produced.batch, TransactionApplicationMode::External)
        .unwrap();
    engine
        .apply(&produced.batch, TransactionApplicationMode::External)
        .unwrap();

    let reader = engine.new_reader();
    assert_eq!(reader.count_nodes(produced.label), 1);
    assert_eq!(engine.stores().counts().last_applied_tx(), 3);
}

#[test]
fn test_recovery_mode_leaves_derived_stores_for_rebuild() {
    let produced = produce_batch();
    let (engine, _ctx) = setup_test_engine().unwrap();
    engine
        .apply(&produced.batch, TransactionApplicationMode::Recovery)
        .unwrap();

    let reader = engine.new_reader();
    // records and token caches are written
    assert_eq!(reader.node_labels(produced.node).unwrap(), vec![produced.label]);
    assert_eq!(reader.token_id(TokenKind::Label, "Person"), Some(produced.label));
    // counts and the label scan store are not
    assert_eq!(reader.count_nodes(produced.label), 0);
    assert!(reader.nodes_with_label(produced.label).is_empty());

    engine.rebuild_derived_stores().unwrap();
    let reader = engine.new_reader();
    assert_eq!(reader.count_nodes(produced.label), 1);
    assert_eq!(reader.nodes_with_label(produced.label), vec![produced.node]);
}

#[test]
fn test_reverse_recovery_restores_before_images() {
    let produced = produce_batch();
    let (engine, _ctx) = setup_test_engine().unwrap();
    engine
        .apply(&produced.batch, TransactionApplicationMode::External)
        .unwrap();

    let reversed: Vec<TransactionToApply> = produced.batch.iter().rev().cloned().collect();
    engine
        .apply(&reversed, TransactionApplicationMode::ReverseRecovery)
        .unwrap();

    let reader = engine.new_reader();
    assert!(reader.node(produced.node).unwrap().is_none());
    assert_eq!(reader.node_property(produced.node, produced.key).unwrap(), None);
    assert_eq!(reader.token_id(TokenKind::Label, "Person"), None);
    assert_eq!(reader.token_id(TokenKind::PropertyKey, "name"), None);
    assert!(engine.health().is_healthy());
}

#[test]
fn test_applied_recreate_withdraws_id_from_reuse() {
    let (source, _source_ctx) = setup_test_database().unwrap();
    let mut tx = source.begin_tx().unwrap();
    let nodes: Vec<u64> = (0..3).map(|_| tx.node_create().unwrap()).collect();
    tx.commit().unwrap();
    let mut tx = source.begin_tx().unwrap();
    tx.node_delete(nodes[1]).unwrap();
    tx.commit().unwrap();
    assert!(source.engine().maintenance() >= 1);
    let mut tx = source.begin_tx().unwrap();
    assert_eq!(tx.node_create().unwrap(), nodes[1]);
    tx.commit().unwrap();

    let entries: Vec<TransactionToApply> = source
        .log()
        .read_entries_after(0)
        .unwrap()
        .into_iter()
        .map(TransactionToApply::from)
        .collect();
    assert_eq!(entries.len(), 3);

    for mode in [TransactionApplicationMode::External, TransactionApplicationMode::Recovery] {
        let (engine, _ctx) = setup_test_engine().unwrap();
        engine.apply(&entries[..2], mode).unwrap();
        assert_eq!(engine.maintenance(), 1);
        engine.apply(&entries[2..], mode).unwrap();

        assert!(engine.new_reader().node(nodes[1]).unwrap().is_some());
        assert_eq!(engine.stores().nodes().ids().free_count(), 0);
        let context = engine.allocate_command_creation_context();
        assert_eq!(context.reserve_node(), 3, "{:?} left a live id reusable", mode);
    }
}

#[test]
fn test_high_ids_move_only_with_high_id_applier() {
    let produced = produce_batch();

    let (internal, _internal_ctx) = setup_test_engine().unwrap();
    assert!(!internal
        .applier_names(TransactionApplicationMode::Internal)
        .contains(&"high-id"));
    internal
        .apply(&produced.batch, TransactionApplicationMode::Internal)
        .unwrap();
    assert!(internal.new_reader().node(produced.node).unwrap().is_some());
    assert_eq!(internal.stores().nodes().high_id(), 0);
    assert_eq!(internal.stores().properties().high_id(), 0);

    let (external, _external_ctx) = setup_test_engine().unwrap();
    assert!(external
        .applier_names(TransactionApplicationMode::External)
        .contains(&"high-id"));
    external
        .apply(&produced.batch, TransactionApplicationMode::External)
        .unwrap();
    assert_eq!(external.stores().nodes().high_id(), produced.node + 1);
    assert!(external.stores().properties().high_id() >= 1);
}

#[test]
fn test_failed_apply_panics_health_once() {
    let (engine, _ctx) = setup_test_engine().unwrap();
    let broken = TransactionToApply::new(
        7,
        vec![Command::Node(NodeCommand {
            id: u64::MAX,
            before: NodeRecord::default(),
            after: NodeRecord::new_in_use(),
        })],
    );

    let err = engine
        .apply(&[broken], TransactionApplicationMode::External)
        .unwrap_err();
    assert!(matches!(err, Error::ApplyFailed { tx_id: 7, .. }));
    assert_eq!(engine.health().status(), HealthStatus::Panicked);
    assert_eq!(engine.health().panic_calls(), 1);
    assert!(engine.health().cause().unwrap().contains("out of range"));

    let err = engine
        .apply(&[TransactionToApply::new(8, Vec::new())], TransactionApplicationMode::External)
        .unwrap_err();
    assert!(matches!(err, Error::StoreNotAvailable(_)));
    assert_eq!(engine.health().panic_calls(), 1);
}

#[test]
fn test_database_refuses_transactions_after_failed_apply() {
    let (db, _ctx) = setup_test_database().unwrap();
    let broken = TransactionToApply::new(
        1,
        vec![Command::Node(NodeCommand {
            id: u64::MAX,
            before: NodeRecord::default(),
            after: NodeRecord::new_in_use(),
        })],
    );
    assert!(db.apply_external(&[broken]).is_err());
    assert!(!db.health().is_healthy());
    assert!(matches!(db.begin_tx(), Err(Error::StoreNotAvailable(_))));
}
