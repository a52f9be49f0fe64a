//! Property tests for relationship chains
//!
//! Random sequences of relationship creations and deletions must leave every
//! node's stored chain holding exactly the relationships that touch it.

use proptest::prelude::*;
use recstore_core::lock::Direction;
use recstore_core::storage::ANY;
use recstore_core::testing::setup_test_database;
use std::collections::{BTreeMap, BTreeSet};

const NODES: usize = 5;

const CASES: u32 = if cfg!(feature = "slow-tests") { 256 } else { 24 };

#[derive(Debug, Clone)]
enum Operation {
    Create { start: usize, end: usize },
    Delete { pick: usize },
    DeleteAllOf { node: usize },
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0..NODES, 0..NODES).prop_map(|(start, end)| Operation::Create { start, end }),
        2 => any::<usize>().prop_map(|pick| Operation::Delete { pick }),
        1 => (0..NODES).prop_map(|node| Operation::DeleteAllOf { node }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(CASES))]

    #[test]
    fn prop_chains_match_committed_relationships(
        ops in prop::collection::vec(arb_operation(), 1..24)
    ) {
        let (db, _ctx) = setup_test_database().unwrap();
        let knows = db.relationship_type("KNOWS").unwrap();

        let mut tx = db.begin_tx().unwrap();
        let nodes: Vec<u64> = (0..NODES).map(|_| tx.node_create().unwrap()).collect();
        tx.commit().unwrap();

        // relationship id -> (start, end)
        let mut model: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
        for op in ops {
            let mut tx = db.begin_tx().unwrap();
            match op {
                Operation::Create { start, end } => {
                    let id = tx.relationship_create(nodes[start], knows, nodes[end]).unwrap();
                    model.insert(id, (nodes[start], nodes[end]));
                }
                Operation::Delete { pick } => {
                    if model.is_empty() {
                        continue;
                    }
                    let id = *model.keys().nth(pick % model.len()).unwrap();
                    tx.relationship_delete(id).unwrap();
                    model.remove(&id);
                }
                Operation::DeleteAllOf { node } => {
                    let node = nodes[node];
                    let ids: Vec<u64> = model
                        .iter()
                        .filter(|(_, (s, e))| *s == node || *e == node)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in &ids {
                        tx.relationship_delete(*id).unwrap();
                        model.remove(id);
                    }
                }
            }
            tx.commit().unwrap();
        }

        let reader = db.new_reader();
        for node in &nodes {
            let expected: BTreeSet<u64> = model
                .iter()
                .filter(|(_, (s, e))| s == node || e == node)
                .map(|(id, _)| *id)
                .collect();
            let items = reader.node_relationships(*node).unwrap();
            let actual: BTreeSet<u64> = items.iter().map(|item| item.id).collect();
            prop_assert_eq!(items.len(), actual.len(), "relationship listed twice in chain");
            prop_assert_eq!(&actual, &expected);

            for item in items {
                let (start, end) = model[&item.id];
                let direction = if start == end {
                    Direction::Loop
                } else if start == *node {
                    Direction::Outgoing
                } else {
                    Direction::Incoming
                };
                prop_assert_eq!(item.direction, direction);
                prop_assert_eq!(item.other_node, if start == *node { end } else { start });
                prop_assert_eq!(item.type_id, knows);
            }
        }
        prop_assert_eq!(reader.count_relationships(ANY, ANY, ANY), model.len() as i64);
        prop_assert_eq!(reader.count_relationships(ANY, knows, ANY), model.len() as i64);
        prop_assert!(db.health().is_healthy());
    }
}
