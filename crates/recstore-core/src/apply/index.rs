//! Label scan and schema index maintenance
//!
//! Runs after the record applier, so when a transaction closes the stores
//! already hold its after images. Label updates are collected for the whole
//! batch and handed to the label scan `WorkSync` when the batch closes;
//! property index updates are computed and submitted per transaction.

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::{Command, PropertyOwner};
use crate::index::{
    IndexActivator, IndexUpdate, IndexUpdateWork, IndexingService, LabelScanStore,
    LabelUpdateWork, NodeLabelUpdate, WorkSync,
};
use crate::lock::LockGroup;
use crate::storage::property::PropertyValue;
use crate::storage::record::{NodeRecord, Record};
use crate::storage::schema::SchemaCache;
use crate::storage::token::{KeyId, LabelId};
use crate::storage::Stores;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Coalescing writer of the label scan store
pub type LabelScanWorkSync = WorkSync<Arc<LabelScanStore>, LabelUpdateWork>;
/// Coalescing writer of the schema indexes
pub type IndexWorkSync = WorkSync<Arc<IndexingService>, IndexUpdateWork>;

/// Applier for the label scan store and the schema indexes
pub struct IndexBatchApplier<'a> {
    stores: &'a Stores,
    schema_cache: &'a SchemaCache,
    indexing: &'a IndexingService,
    label_scan: &'a LabelScanWorkSync,
    index_updates: &'a IndexWorkSync,
    activator: &'a IndexActivator,
    label_updates: Vec<NodeLabelUpdate>,
}

impl<'a> IndexBatchApplier<'a> {
    /// Applier feeding the given writers
    pub fn new(
        stores: &'a Stores,
        schema_cache: &'a SchemaCache,
        indexing: &'a IndexingService,
        label_scan: &'a LabelScanWorkSync,
        index_updates: &'a IndexWorkSync,
        activator: &'a IndexActivator,
    ) -> Self {
        Self {
            stores,
            schema_cache,
            indexing,
            label_scan,
            index_updates,
            activator,
            label_updates: Vec::new(),
        }
    }
}

fn labels_of(record: &NodeRecord) -> Vec<LabelId> {
    if record.in_use() {
        record.labels()
    } else {
        Vec::new()
    }
}

#[derive(Default)]
struct NodeChange {
    labels: Option<(Vec<LabelId>, Vec<LabelId>)>,
    properties: BTreeMap<KeyId, (Option<PropertyValue>, Option<PropertyValue>)>,
}

struct IndexTransactionApplier<'b, 'a> {
    parent: &'b mut IndexBatchApplier<'a>,
    nodes: BTreeMap<u64, NodeChange>,
}

impl IndexTransactionApplier<'_, '_> {
    fn index_updates(&self) -> Result<Vec<IndexUpdate>> {
        let indexes = self.parent.schema_cache.indexes();
        let mut updates = Vec::new();
        if indexes.is_empty() {
            return Ok(updates);
        }
        let stores = self.parent.stores;
        for (node, change) in &self.nodes {
            let (before_labels, after_labels): (BTreeSet<LabelId>, BTreeSet<LabelId>) =
                match &change.labels {
                    Some((before, after)) => {
                        (before.iter().copied().collect(), after.iter().copied().collect())
                    }
                    None => {
                        let labels: BTreeSet<LabelId> = stores
                            .nodes()
                            .read_in_use(*node)?
                            .map(|r| r.labels().into_iter().collect())
                            .unwrap_or_default();
                        (labels.clone(), labels)
                    }
                };
            for rule in &indexes {
                let (label, key) = (rule.label_id(), rule.property_key_id());
                let in_before = before_labels.contains(&label);
                let in_after = after_labels.contains(&label);
                if !in_before && !in_after {
                    continue;
                }
                let (changed_before, changed_after) = match change.properties.get(&key) {
                    Some((before, after)) => (before.clone(), after.clone()),
                    None => {
                        let current = stores.node_property(*node, key)?;
                        (current.clone(), current)
                    }
                };
                let before = if in_before { changed_before } else { None };
                let after = if in_after { changed_after } else { None };
                if before != after {
                    updates.push(IndexUpdate {
                        index_id: rule.id,
                        node_id: *node,
                        before,
                        after,
                    });
                }
            }
        }
        Ok(updates)
    }
}

impl TransactionApplier for IndexTransactionApplier<'_, '_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Node(c) => {
                let before = labels_of(&c.before);
                let after = labels_of(&c.after);
                if before != after {
                    self.parent.label_updates.push(NodeLabelUpdate {
                        node_id: c.id,
                        labels_before: before.clone(),
                        labels_after: after.clone(),
                    });
                }
                self.nodes.entry(c.id).or_default().labels = Some((before, after));
            }
            Command::Property(c) => {
                if let PropertyOwner::Node(node) = c.owner {
                    let change = self.nodes.entry(node).or_default();
                    if c.before.in_use() {
                        change
                            .properties
                            .entry(c.before.key_id)
                            .or_insert((None, None))
                            .0 = c.before_value.clone();
                    }
                    if c.after.in_use() {
                        change
                            .properties
                            .entry(c.after.key_id)
                            .or_insert((None, None))
                            .1 = c.after_value.clone();
                    }
                }
            }
            Command::Schema(c) => match (&c.before, &c.after) {
                (None, Some(rule)) if rule.is_index() => {
                    self.parent.indexing.create_index(rule.clone());
                    self.parent.activator.activate_later(rule.id);
                }
                (Some(rule), None) if rule.is_index() => {
                    self.parent.indexing.drop_index(rule.id);
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let updates = self.index_updates()?;
        if updates.is_empty() {
            return Ok(());
        }
        self.parent.index_updates.apply(IndexUpdateWork(updates))
    }
}

impl<'a> BatchTransactionApplier for IndexBatchApplier<'a> {
    fn name(&self) -> &'static str {
        "index"
    }

    fn start_tx<'b>(
        &'b mut self,
        _tx: &'b TransactionToApply,
        _locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(IndexTransactionApplier {
            parent: self,
            nodes: BTreeMap::new(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        if self.label_updates.is_empty() {
            return Ok(());
        }
        let updates = std::mem::take(&mut self.label_updates);
        self.label_scan.apply(LabelUpdateWork(updates))
    }
}
