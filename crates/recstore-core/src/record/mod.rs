//! Record-level transaction state
//!
//! Turns the logical changes of a transaction into before/after record
//! images and finally into [`Command`](crate::command::Command)s. Records are
//! loaded on first touch and kept in [`RecordChanges`] so that every later
//! change in the same transaction sees the earlier ones.

pub mod integrity;
pub mod state;
pub mod visitor;

pub use integrity::IntegrityValidator;
pub use state::{PropertyChange, TransactionRecordState};
pub use visitor::TransactionToRecordStateVisitor;

use crate::command::CommandMode;
use crate::storage::record::Record;
use crate::Result;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Before and after image of one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange<R: Record> {
    /// Record id
    pub id: u64,
    /// Image when first loaded
    pub before: R,
    /// Image after this transaction's changes
    pub after: R,
}

impl<R: Record> RecordChange<R> {
    /// Whether the record differs from its loaded image
    pub fn is_changed(&self) -> bool {
        self.before != self.after
    }

    /// Create, update or delete
    pub fn mode(&self) -> CommandMode {
        CommandMode::of(&self.before, &self.after)
    }
}

/// Records touched by a transaction, keyed by id
#[derive(Debug, Clone)]
pub struct RecordChanges<R: Record> {
    changes: BTreeMap<u64, RecordChange<R>>,
}

impl<R: Record> Default for RecordChanges<R> {
    fn default() -> Self {
        Self {
            changes: BTreeMap::new(),
        }
    }
}

impl<R: Record> RecordChanges<R> {
    /// Empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the record has been touched
    pub fn contains(&self, id: u64) -> bool {
        self.changes.contains_key(&id)
    }

    /// Change of a touched record
    pub fn get(&self, id: u64) -> Option<&RecordChange<R>> {
        self.changes.get(&id)
    }

    /// Mutable after image, loading the record with `load` on first touch
    pub fn get_or_load(&mut self, id: u64, load: impl FnOnce(u64) -> Result<R>) -> Result<&mut R> {
        match self.changes.entry(id) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().after),
            Entry::Vacant(entry) => {
                let record = load(id)?;
                let change = entry.insert(RecordChange {
                    id,
                    before: record,
                    after: record,
                });
                Ok(&mut change.after)
            }
        }
    }

    /// Add a record that did not exist before this transaction
    pub fn create(&mut self, id: u64, record: R) -> &mut R {
        let change = self.changes.entry(id).or_insert_with(|| RecordChange {
            id,
            before: R::default(),
            after: R::default(),
        });
        change.after = record;
        &mut change.after
    }

    /// Changed records with the given mode, ascending by id
    pub fn changed(&self, mode: CommandMode) -> impl Iterator<Item = &RecordChange<R>> + '_ {
        self.changes
            .values()
            .filter(move |c| c.is_changed() && c.mode() == mode)
    }

    /// Number of touched records
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether no record was touched
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::NodeRecord;
    use crate::Error;

    #[test]
    fn test_get_or_load_loads_once() {
        let mut changes: RecordChanges<NodeRecord> = RecordChanges::new();
        let mut loads = 0;
        {
            let node = changes
                .get_or_load(3, |_| {
                    loads += 1;
                    Ok(NodeRecord::new_in_use())
                })
                .unwrap();
            node.add_label(1);
        }
        let node = changes
            .get_or_load(3, |_| Err(Error::internal("loaded twice")))
            .unwrap();
        assert!(node.has_label(1));
        assert_eq!(loads, 1);
        assert_eq!(changes.changed(CommandMode::Update).count(), 1);
    }

    #[test]
    fn test_unchanged_records_are_not_reported() {
        let mut changes: RecordChanges<NodeRecord> = RecordChanges::new();
        changes
            .get_or_load(1, |_| Ok(NodeRecord::new_in_use()))
            .unwrap();
        changes.create(2, NodeRecord::new_in_use());
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.changed(CommandMode::Update).count(), 0);
        let created: Vec<u64> = changes.changed(CommandMode::Create).map(|c| c.id).collect();
        assert_eq!(created, vec![2]);
    }

    #[test]
    fn test_load_failure_leaves_no_entry() {
        let mut changes: RecordChanges<NodeRecord> = RecordChanges::new();
        assert!(changes
            .get_or_load(5, |id| Err(Error::not_found(format!("node {}", id))))
            .is_err());
        assert!(!changes.contains(5));
    }
}
