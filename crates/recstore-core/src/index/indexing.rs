//! Schema property indexes
//!
//! One in-memory index per index rule: property value → node ids. Indexes
//! are populated from the node store when the service starts and when a new
//! index rule is activated at the end of the batch that created it. Until
//! then an index is `Populating` and seeks fall back to label scans.

use crate::index::work_sync::Work;
use crate::storage::Stores;
use crate::storage::property::PropertyValue;
use crate::storage::schema::SchemaRule;
use crate::storage::token::{KeyId, LabelId};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle state of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Created, not yet populated
    Populating,
    /// Populated and kept up to date
    Online,
    /// Population failed
    Failed(String),
}

/// Property index of one index rule
#[derive(Debug)]
pub struct PropertyIndex {
    rule: SchemaRule,
    state: RwLock<IndexState>,
    entries: RwLock<BTreeMap<PropertyValue, BTreeSet<u64>>>,
}

impl PropertyIndex {
    fn new(rule: SchemaRule) -> Self {
        Self {
            rule,
            state: RwLock::new(IndexState::Populating),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// The index rule
    pub fn rule(&self) -> &SchemaRule {
        &self.rule
    }

    /// Current state
    pub fn state(&self) -> IndexState {
        self.state.read().clone()
    }

    /// Whether seeks are answered by this index
    pub fn is_online(&self) -> bool {
        *self.state.read() == IndexState::Online
    }

    /// Nodes indexed under `value`
    pub fn seek(&self, value: &PropertyValue) -> Vec<u64> {
        self.entries
            .read()
            .get(value)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of (value, node) entries
    pub fn entry_count(&self) -> usize {
        self.entries.read().values().map(|n| n.len()).sum()
    }

    fn add(&self, value: PropertyValue, node: u64) {
        self.entries.write().entry(value).or_default().insert(node);
    }

    fn remove(&self, value: &PropertyValue, node: u64) {
        let mut entries = self.entries.write();
        if let Some(nodes) = entries.get_mut(value) {
            nodes.remove(&node);
            if nodes.is_empty() {
                entries.remove(value);
            }
        }
    }

    fn populate(&self, stores: &Stores) -> Result<usize> {
        let label = self.rule.label_id();
        let key = self.rule.property_key_id();
        let mut entries: BTreeMap<PropertyValue, BTreeSet<u64>> = BTreeMap::new();
        let mut count = 0;
        stores.nodes().for_each_in_use(|id, node| {
            if node.has_label(label) {
                if let Some(value) = stores.read_property(node.next_prop, key)? {
                    entries.entry(value).or_default().insert(id);
                    count += 1;
                }
            }
            Ok(())
        })?;
        *self.entries.write() = entries;
        Ok(count)
    }
}

/// Change of one node's entry in one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUpdate {
    /// Index rule id
    pub index_id: u64,
    /// Node id
    pub node_id: u64,
    /// Indexed value before
    pub before: Option<PropertyValue>,
    /// Indexed value after
    pub after: Option<PropertyValue>,
}

/// Owner of all property indexes
#[derive(Debug, Default)]
pub struct IndexingService {
    indexes: RwLock<BTreeMap<u64, Arc<PropertyIndex>>>,
    started: AtomicBool,
}

impl IndexingService {
    /// Service without indexes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register indexes for the given rules; non-index rules are ignored
    pub fn init(&self, rules: impl IntoIterator<Item = SchemaRule>) {
        let mut indexes = self.indexes.write();
        indexes.clear();
        for rule in rules.into_iter().filter(|r| r.is_index()) {
            indexes.insert(rule.id, Arc::new(PropertyIndex::new(rule)));
        }
    }

    /// Populate every index that is not online
    pub fn start(&self, stores: &Stores) -> Result<()> {
        let ids: Vec<u64> = self.indexes.read().keys().copied().collect();
        for id in ids {
            self.activate(id, stores);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the service has started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register an index created by an applied transaction; it stays
    /// `Populating` until activated
    pub fn create_index(&self, rule: SchemaRule) {
        self.indexes
            .write()
            .entry(rule.id)
            .or_insert_with(|| Arc::new(PropertyIndex::new(rule)));
    }

    /// Populate an index and bring it online; failures leave it `Failed`
    pub fn activate(&self, id: u64, stores: &Stores) {
        let Some(index) = self.index(id) else {
            return;
        };
        match index.populate(stores) {
            Ok(count) => {
                *index.state.write() = IndexState::Online;
                tracing::info!("Index {} online with {} entries", id, count);
            }
            Err(e) => {
                tracing::error!("Population of index {} failed: {}", id, e);
                *index.state.write() = IndexState::Failed(e.to_string());
            }
        }
    }

    /// Repopulate every index from the stores
    pub fn rebuild_all(&self, stores: &Stores) {
        let ids: Vec<u64> = self.indexes.read().keys().copied().collect();
        for id in ids {
            self.activate(id, stores);
        }
    }

    /// Remove an index
    pub fn drop_index(&self, id: u64) -> bool {
        self.indexes.write().remove(&id).is_some()
    }

    /// Index by rule id
    pub fn index(&self, id: u64) -> Option<Arc<PropertyIndex>> {
        self.indexes.read().get(&id).cloned()
    }

    /// Index on (label, key), whatever its state
    pub fn index_for(&self, label: LabelId, key: KeyId) -> Option<Arc<PropertyIndex>> {
        self.indexes
            .read()
            .values()
            .find(|i| i.rule.label_id() == label && i.rule.property_key_id() == key)
            .cloned()
    }

    /// Ids of all indexes
    pub fn index_ids(&self) -> Vec<u64> {
        self.indexes.read().keys().copied().collect()
    }

    /// Nodes with `label` and `key` = `value`, if an online index covers it
    pub fn seek(&self, label: LabelId, key: KeyId, value: &PropertyValue) -> Option<Vec<u64>> {
        self.index_for(label, key)
            .filter(|index| index.is_online())
            .map(|index| index.seek(value))
    }

    /// Apply entry changes; updates for unknown indexes are skipped
    pub fn apply_updates(&self, updates: &[IndexUpdate]) {
        for update in updates {
            let Some(index) = self.index(update.index_id) else {
                continue;
            };
            if let Some(before) = &update.before {
                index.remove(before, update.node_id);
            }
            if let Some(after) = &update.after {
                index.add(after.clone(), update.node_id);
            }
        }
    }

    /// Make index state durable. Indexes live in memory and are repopulated on start.
    pub fn force(&self) -> Result<()> {
        tracing::debug!("Forced {} indexes", self.indexes.read().len());
        Ok(())
    }

    /// Drop all indexes
    pub fn shutdown(&self) {
        self.indexes.write().clear();
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Index updates of one or more transactions, applied through a `WorkSync`
#[derive(Debug, Default)]
pub struct IndexUpdateWork(pub Vec<IndexUpdate>);

impl Work<Arc<IndexingService>> for IndexUpdateWork {
    fn combine(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    fn apply(self, target: &mut Arc<IndexingService>) -> Result<()> {
        target.apply_updates(&self.0);
        Ok(())
    }
}

/// Indexes created during a batch, brought online when the batch ends
#[derive(Debug, Default)]
pub struct IndexActivator {
    pending: Mutex<Vec<u64>>,
}

impl IndexActivator {
    /// Nothing to activate
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an index to activate
    pub fn activate_later(&self, index_id: u64) {
        self.pending.lock().push(index_id);
    }

    /// Indexes waiting for activation
    pub fn pending(&self) -> Vec<u64> {
        self.pending.lock().clone()
    }

    /// Populate and bring online every remembered index
    pub fn activate(&self, indexing: &IndexingService, stores: &Stores) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for id in pending {
            indexing.activate(id, stores);
        }
    }
}
