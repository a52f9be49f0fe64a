//! Label scan store: label id → set of node ids
//!
//! Kept in memory as one `RoaringTreemap` per label and written to
//! `labelscan.store` on force. The file is a derived store: when it is
//! missing, unreadable or the database was not shut down cleanly, it is
//! rebuilt from the node store.

use crate::index::work_sync::Work;
use crate::storage::record::NodeRecord;
use crate::storage::record_store::RecordStore;
use crate::storage::token::LabelId;
use crate::{Error, Result};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// File name of the label scan store
pub const LABEL_SCAN_STORE: &str = "labelscan.store";

/// Label change of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLabelUpdate {
    /// Node id
    pub node_id: u64,
    /// Labels before (empty for a created node)
    pub labels_before: Vec<LabelId>,
    /// Labels after (empty for a deleted node)
    pub labels_after: Vec<LabelId>,
}

/// Label scan store
pub struct LabelScanStore {
    path: PathBuf,
    labels: RwLock<BTreeMap<LabelId, RoaringTreemap>>,
    needs_rebuild: AtomicBool,
    dirty: AtomicBool,
}

impl LabelScanStore {
    /// Create a store backed by `path`; nothing is read until [`init`](Self::init)
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            labels: RwLock::new(BTreeMap::new()),
            needs_rebuild: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the file; a missing or corrupt file marks the store for rebuild
    pub fn init(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::info!("Label scan store {:?} missing; will rebuild", self.path);
            self.needs_rebuild.store(true, Ordering::SeqCst);
            return Ok(());
        }
        match self.load() {
            Ok(labels) => {
                *self.labels.write() = labels;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Label scan store {:?} unreadable ({}); will rebuild", self.path, e);
                self.needs_rebuild.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn load(&self) -> Result<BTreeMap<LabelId, RoaringTreemap>> {
        let bytes = std::fs::read(&self.path)?;
        let entries: Vec<(LabelId, Vec<u8>)> = bincode::deserialize(&bytes)?;
        let mut labels = BTreeMap::new();
        for (label, serialized) in entries {
            let bitmap = RoaringTreemap::deserialize_from(&serialized[..])
                .map_err(|e| Error::storage(format!("label {} bitmap: {}", label, e)))?;
            labels.insert(label, bitmap);
        }
        Ok(labels)
    }

    /// Mark the store for rebuild on start
    pub fn mark_for_rebuild(&self) {
        self.needs_rebuild.store(true, Ordering::SeqCst);
    }

    /// Whether the store must be rebuilt before use
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::SeqCst)
    }

    /// Rebuild if needed
    pub fn start(&self, nodes: &RecordStore<NodeRecord>) -> Result<()> {
        if self.needs_rebuild() {
            self.rebuild(nodes)?;
        }
        Ok(())
    }

    /// Replace the contents with a scan of the node store
    pub fn rebuild(&self, nodes: &RecordStore<NodeRecord>) -> Result<()> {
        let mut labels: BTreeMap<LabelId, RoaringTreemap> = BTreeMap::new();
        nodes.for_each_in_use(|id, node| {
            for label in node.labels() {
                labels.entry(label).or_default().insert(id);
            }
            Ok(())
        })?;
        let total: u64 = labels.values().map(|b| b.len()).sum();
        *self.labels.write() = labels;
        self.needs_rebuild.store(false, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        self.force()?;
        tracing::info!("Rebuilt label scan store: {} label entries", total);
        Ok(())
    }

    /// Apply label updates
    pub fn apply(&self, updates: &[NodeLabelUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut labels = self.labels.write();
        for update in updates {
            for label in &update.labels_before {
                if !update.labels_after.contains(label) {
                    if let Some(bitmap) = labels.get_mut(label) {
                        bitmap.remove(update.node_id);
                    }
                }
            }
            for label in &update.labels_after {
                labels.entry(*label).or_default().insert(update.node_id);
            }
        }
        labels.retain(|_, bitmap| !bitmap.is_empty());
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Node ids with `label`, ascending
    pub fn nodes_with_label(&self, label: LabelId) -> Vec<u64> {
        self.labels
            .read()
            .get(&label)
            .map(|bitmap| bitmap.iter().collect())
            .unwrap_or_default()
    }

    /// Whether `node` is recorded under `label`
    pub fn contains(&self, label: LabelId, node: u64) -> bool {
        self.labels
            .read()
            .get(&label)
            .is_some_and(|bitmap| bitmap.contains(node))
    }

    /// Number of nodes recorded under `label`
    pub fn count(&self, label: LabelId) -> u64 {
        self.labels.read().get(&label).map(|b| b.len()).unwrap_or(0)
    }

    /// Write the store to disk if it changed
    pub fn force(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let entries = {
            let labels = self.labels.read();
            let mut entries = Vec::with_capacity(labels.len());
            for (label, bitmap) in labels.iter() {
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                bitmap.serialize_into(&mut bytes)?;
                entries.push((*label, bytes));
            }
            entries
        };
        let written = bincode::serialize(&entries)
            .map_err(Error::from)
            .and_then(|bytes| {
                let tmp = self.path.with_extension("tmp");
                std::fs::write(&tmp, &bytes)?;
                std::fs::rename(&tmp, &self.path)?;
                Ok(())
            });
        if written.is_err() {
            // still unwritten; the next force tries again
            self.dirty.store(true, Ordering::SeqCst);
        }
        written
    }

    /// Force and release
    pub fn shutdown(&self) -> Result<()> {
        self.force()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Label updates of one or more batches, applied through a `WorkSync`
#[derive(Debug, Default)]
pub struct LabelUpdateWork(pub Vec<NodeLabelUpdate>);

impl Work<Arc<LabelScanStore>> for LabelUpdateWork {
    fn combine(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    fn apply(self, target: &mut Arc<LabelScanStore>) -> Result<()> {
        target.apply(&self.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::Record;
    use tempfile::TempDir;

    fn create_test_store() -> (LabelScanStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LabelScanStore::new(dir.path().join(LABEL_SCAN_STORE));
        (store, dir)
    }

    fn update(node_id: u64, before: &[LabelId], after: &[LabelId]) -> NodeLabelUpdate {
        NodeLabelUpdate {
            node_id,
            labels_before: before.to_vec(),
            labels_after: after.to_vec(),
        }
    }

    #[test]
    fn test_missing_file_needs_rebuild() {
        let (store, _dir) = create_test_store();
        store.init().unwrap();
        assert!(store.needs_rebuild());
    }

    #[test]
    fn test_apply_updates() {
        let (store, _dir) = create_test_store();
        store.apply(&[update(1, &[], &[0, 2]), update(2, &[], &[2])]);
        assert_eq!(store.nodes_with_label(2), vec![1, 2]);

        store.apply(&[update(1, &[0, 2], &[0])]);
        assert_eq!(store.nodes_with_label(2), vec![2]);
        assert!(store.contains(0, 1));

        store.apply(&[update(1, &[0], &[])]);
        assert!(store.nodes_with_label(0).is_empty());
    }

    #[test]
    fn test_force_and_reload() {
        let (store, dir) = create_test_store();
        store.apply(&[update(7, &[], &[3]), update(9, &[], &[3])]);
        store.force().unwrap();

        let reopened = LabelScanStore::new(dir.path().join(LABEL_SCAN_STORE));
        reopened.init().unwrap();
        assert!(!reopened.needs_rebuild());
        assert_eq!(reopened.nodes_with_label(3), vec![7, 9]);
        assert_eq!(reopened.count(3), 2);
    }

    #[test]
    fn test_corrupt_file_needs_rebuild() {
        let (store, dir) = create_test_store();
        std::fs::write(dir.path().join(LABEL_SCAN_STORE), b"garbage").unwrap();
        store.init().unwrap();
        assert!(store.needs_rebuild());
    }

    #[test]
    fn test_rebuild_from_node_store() {
        let (store, dir) = create_test_store();
        let nodes: RecordStore<NodeRecord> =
            RecordStore::open(dir.path().join("nodes.store"), 4096, true).unwrap();
        let mut node = NodeRecord::new_in_use();
        node.add_label(5);
        nodes.write(3, &node).unwrap();
        let mut deleted = node;
        deleted.set_in_use(false);
        nodes.write(4, &deleted).unwrap();
        nodes.rebuild_ids().unwrap();

        store.mark_for_rebuild();
        store.start(&nodes).unwrap();
        assert_eq!(store.nodes_with_label(5), vec![3]);
        assert!(!store.needs_rebuild());
        assert!(store.path().exists());
    }
}
