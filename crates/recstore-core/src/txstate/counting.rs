//! Count deltas of a transaction

use crate::command::Command;
use crate::engine::StorageReader;
use crate::lock::Direction;
use crate::storage::counts::{self, ANY, CountsKey};
use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::schema::SchemaRule;
use crate::storage::token::{LabelId, TokenKind, TypeId};
use crate::txstate::{LabelDiff, PropertyDiff, RelationshipData, TransactionState, TxStateVisitor};
use crate::Result;
use std::collections::BTreeMap;

/// Per-transaction accumulator of counter deltas
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountsRecordState {
    deltas: BTreeMap<CountsKey, i64>,
}

impl CountsRecordState {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the node count of `label`
    pub fn increment_node_count(&mut self, label: LabelId, delta: i64) {
        *self.deltas.entry(CountsKey::node(label)).or_default() += delta;
    }

    /// Add `delta` to a relationship count
    pub fn increment_relationship_count(
        &mut self,
        start_label: LabelId,
        type_id: TypeId,
        end_label: LabelId,
        delta: i64,
    ) {
        *self
            .deltas
            .entry(CountsKey::relationship(start_label, type_id, end_label))
            .or_default() += delta;
    }

    /// Non-zero deltas
    pub fn deltas(&self) -> BTreeMap<CountsKey, i64> {
        self.deltas
            .iter()
            .filter(|(_, d)| **d != 0)
            .map(|(k, d)| (*k, *d))
            .collect()
    }

    /// Whether no counter changes
    pub fn is_empty(&self) -> bool {
        self.deltas.values().all(|d| *d == 0)
    }

    /// Append one count command per non-zero delta, in key order
    pub fn extract_commands(&self, commands: &mut Vec<Command>) {
        for (key, delta) in self.deltas.iter().filter(|(_, d)| **d != 0) {
            commands.push(match *key {
                CountsKey::Node { label } => Command::NodeCount {
                    label,
                    delta: *delta,
                },
                CountsKey::Relationship {
                    start_label,
                    type_id,
                    end_label,
                } => Command::RelationshipCount {
                    start_label,
                    type_id,
                    end_label,
                    delta: *delta,
                },
            });
        }
    }

    fn relationship(&mut self, start_labels: &[LabelId], type_id: TypeId, end_labels: &[LabelId], delta: i64) {
        counts::relationship_deltas(&mut self.deltas, start_labels, type_id, end_labels, delta);
    }

    fn degree_change(&mut self, label: LabelId, type_id: TypeId, direction: Direction, delta: i64) {
        for t in [ANY, type_id] {
            if matches!(direction, Direction::Outgoing | Direction::Loop) {
                self.increment_relationship_count(label, t, ANY, delta);
            }
            if matches!(direction, Direction::Incoming | Direction::Loop) {
                self.increment_relationship_count(ANY, t, label, delta);
            }
        }
    }
}

/// Computes count deltas, then forwards every change to the wrapped visitor.
///
/// Created relationships are counted with the labels their endpoints have
/// after the transaction, deleted ones with the labels before it. A label
/// change on an existing node also moves the counts of its untouched stored
/// relationships from the old label to the new one.
pub struct TransactionCountingStateVisitor<'a> {
    inner: Box<dyn TxStateVisitor + 'a>,
    state: &'a TransactionState,
    reader: &'a StorageReader,
    counts: &'a mut CountsRecordState,
}

impl<'a> TransactionCountingStateVisitor<'a> {
    /// Wrap `inner`, accumulating into `counts`
    pub fn new(
        inner: Box<dyn TxStateVisitor + 'a>,
        state: &'a TransactionState,
        reader: &'a StorageReader,
        counts: &'a mut CountsRecordState,
    ) -> Self {
        Self {
            inner,
            state,
            reader,
            counts,
        }
    }

    fn labels_after(&self, node: u64) -> Result<Vec<LabelId>> {
        Ok(self.state.node_labels_after(self.reader, node)?.into_iter().collect())
    }
}

impl TxStateVisitor for TransactionCountingStateVisitor<'_> {
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        self.inner.visit_created_token(kind, id, name)
    }

    fn visit_created_node(&mut self, id: u64) -> Result<()> {
        self.counts.increment_node_count(ANY, 1);
        self.inner.visit_created_node(id)
    }

    fn visit_deleted_node(&mut self, id: u64) -> Result<()> {
        self.counts.increment_node_count(ANY, -1);
        for label in self.reader.node_labels(id)? {
            self.counts.increment_node_count(label, -1);
        }
        self.inner.visit_deleted_node(id)
    }

    fn visit_created_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()> {
        let start = self.labels_after(data.start_node)?;
        let end = self.labels_after(data.end_node)?;
        self.counts.relationship(&start, data.type_id, &end, 1);
        self.inner.visit_created_relationship(id, data)
    }

    fn visit_deleted_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()> {
        let start = self.reader.node_labels(data.start_node)?;
        let end = self.reader.node_labels(data.end_node)?;
        self.counts.relationship(&start, data.type_id, &end, -1);
        self.inner.visit_deleted_relationship(id, data)
    }

    fn visit_node_label_changes(&mut self, id: u64, diff: &LabelDiff) -> Result<()> {
        for label in &diff.added {
            self.counts.increment_node_count(*label, 1);
        }
        for label in &diff.removed {
            self.counts.increment_node_count(*label, -1);
        }

        if !self.state.is_node_created(id) {
            for item in self.reader.node_relationships(id)? {
                if self.state.is_relationship_deleted(item.id) {
                    continue;
                }
                for label in &diff.added {
                    self.counts.degree_change(*label, item.type_id, item.direction, 1);
                }
                for label in &diff.removed {
                    self.counts.degree_change(*label, item.type_id, item.direction, -1);
                }
            }
        }
        self.inner.visit_node_label_changes(id, diff)
    }

    fn visit_node_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        self.inner.visit_node_property_changes(id, diff)
    }

    fn visit_relationship_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        self.inner.visit_relationship_property_changes(id, diff)
    }

    fn visit_added_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.inner.visit_added_schema_rule(rule)
    }

    fn visit_removed_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.inner.visit_removed_schema_rule(rule)
    }

    fn visit_explicit_index(&mut self, command: &ExplicitIndexCommand) -> Result<()> {
        self.inner.visit_explicit_index(command)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_skips_zero_deltas() {
        let mut counts = CountsRecordState::new();
        counts.increment_node_count(ANY, 1);
        counts.increment_node_count(3, 1);
        counts.increment_node_count(3, -1);
        counts.increment_relationship_count(ANY, 2, ANY, 1);

        let mut commands = Vec::new();
        counts.extract_commands(&mut commands);
        assert_eq!(
            commands,
            vec![
                Command::NodeCount {
                    label: ANY,
                    delta: 1
                },
                Command::RelationshipCount {
                    start_label: ANY,
                    type_id: 2,
                    end_label: ANY,
                    delta: 1
                },
            ]
        );
    }

    #[test]
    fn test_degree_change_for_loop_touches_both_sides() {
        let mut counts = CountsRecordState::new();
        counts.degree_change(4, 1, Direction::Loop, 1);
        let deltas = counts.deltas();
        assert_eq!(deltas.get(&CountsKey::relationship(4, 1, ANY)), Some(&1));
        assert_eq!(deltas.get(&CountsKey::relationship(ANY, 1, 4)), Some(&1));
        assert_eq!(deltas.get(&CountsKey::relationship(4, ANY, ANY)), Some(&1));
        assert_eq!(deltas.get(&CountsKey::relationship(ANY, ANY, 4)), Some(&1));
        assert_eq!(deltas.len(), 4);
    }

    #[test]
    fn test_empty_after_cancelling_deltas() {
        let mut counts = CountsRecordState::new();
        counts.increment_node_count(1, 2);
        counts.increment_node_count(1, -2);
        assert!(counts.is_empty());
        assert!(counts.deltas().is_empty());
    }
}
