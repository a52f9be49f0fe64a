//! Counts store: node counts per label and relationship counts per
//! (start label, type, end label), with `ANY` wildcards.
//!
//! Deltas are applied once per transaction id; replaying a transaction that
//! was already applied is a no-op.

use crate::storage::token::{LabelId, TypeId};
use crate::{Error, Result};
use dashmap::DashMap;
use heed::types::*;
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Wildcard for a label or type position
pub const ANY: u32 = u32::MAX;

const LAST_TX_KEY: &str = "last_applied_tx";

/// Key of one counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CountsKey {
    /// Nodes with `label` (or all nodes for `ANY`)
    Node {
        /// Label or ANY
        label: LabelId,
    },
    /// Relationships matching (start label, type, end label)
    Relationship {
        /// Start node label or ANY
        start_label: LabelId,
        /// Relationship type or ANY
        type_id: TypeId,
        /// End node label or ANY
        end_label: LabelId,
    },
}

impl CountsKey {
    /// Node counter key
    pub fn node(label: LabelId) -> Self {
        CountsKey::Node { label }
    }

    /// Relationship counter key
    pub fn relationship(start_label: LabelId, type_id: TypeId, end_label: LabelId) -> Self {
        CountsKey::Relationship {
            start_label,
            type_id,
            end_label,
        }
    }
}

/// Accumulate the counter changes of one node with `labels`
pub fn node_deltas(deltas: &mut BTreeMap<CountsKey, i64>, labels: &[LabelId], delta: i64) {
    *deltas.entry(CountsKey::node(ANY)).or_default() += delta;
    for label in labels {
        *deltas.entry(CountsKey::node(*label)).or_default() += delta;
    }
}

/// Accumulate the counter changes of one relationship between nodes with the given labels
pub fn relationship_deltas(
    deltas: &mut BTreeMap<CountsKey, i64>,
    start_labels: &[LabelId],
    type_id: TypeId,
    end_labels: &[LabelId],
    delta: i64,
) {
    for t in [ANY, type_id] {
        *deltas.entry(CountsKey::relationship(ANY, t, ANY)).or_default() += delta;
        for label in start_labels {
            *deltas.entry(CountsKey::relationship(*label, t, ANY)).or_default() += delta;
        }
        for label in end_labels {
            *deltas.entry(CountsKey::relationship(ANY, t, *label)).or_default() += delta;
        }
    }
}

/// Persisted counters with an in-memory mirror
pub struct CountsStore {
    env: Env,
    counts: Database<SerdeBincode<CountsKey>, SerdeBincode<i64>>,
    meta: Database<Str, SerdeBincode<u64>>,
    cache: DashMap<CountsKey, i64>,
    last_applied_tx: AtomicU64,
    started: AtomicBool,
}

impl CountsStore {
    /// Open the counts databases and load the mirror
    pub fn open(env: &Env) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let counts: Database<SerdeBincode<CountsKey>, SerdeBincode<i64>> =
            env.create_database(&mut wtxn, Some("counts"))?;
        let meta: Database<Str, SerdeBincode<u64>> =
            env.create_database(&mut wtxn, Some("counts_meta"))?;
        wtxn.commit()?;

        let store = Self {
            env: env.clone(),
            counts,
            meta,
            cache: DashMap::new(),
            last_applied_tx: AtomicU64::new(0),
            started: AtomicBool::new(false),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        self.cache.clear();
        for result in self.counts.iter(&rtxn)? {
            let (key, value) = result?;
            self.cache.insert(key, value);
        }
        let last = self.meta.get(&rtxn, LAST_TX_KEY)?.unwrap_or(0);
        self.last_applied_tx.store(last, Ordering::SeqCst);
        Ok(())
    }

    /// Accept updates from now on
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Stop accepting updates
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Whether updates are accepted
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Current value of a counter
    pub fn get(&self, key: CountsKey) -> i64 {
        self.cache.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// Number of nodes with `label` (`ANY` for all nodes)
    pub fn node_count(&self, label: LabelId) -> i64 {
        self.get(CountsKey::node(label))
    }

    /// Number of relationships matching the pattern
    pub fn relationship_count(&self, start_label: LabelId, type_id: TypeId, end_label: LabelId) -> i64 {
        self.get(CountsKey::relationship(start_label, type_id, end_label))
    }

    /// Highest transaction whose deltas are included
    pub fn last_applied_tx(&self) -> u64 {
        self.last_applied_tx.load(Ordering::SeqCst)
    }

    /// Apply the deltas of `tx_id`; returns false if the transaction was already applied
    pub fn apply(&self, tx_id: u64, deltas: &BTreeMap<CountsKey, i64>) -> Result<bool> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::invalid_state("counts store not started"));
        }
        if tx_id <= self.last_applied_tx() {
            tracing::debug!("Counts already include transaction {}; skipping", tx_id);
            return Ok(false);
        }

        let mut wtxn = self.env.write_txn()?;
        let mut updated = Vec::with_capacity(deltas.len());
        for (key, delta) in deltas.iter().filter(|(_, d)| **d != 0) {
            let value = self.counts.get(&wtxn, key)?.unwrap_or(0) + delta;
            if value == 0 {
                self.counts.delete(&mut wtxn, key)?;
            } else {
                self.counts.put(&mut wtxn, key, &value)?;
            }
            updated.push((*key, value));
        }
        self.meta.put(&mut wtxn, LAST_TX_KEY, &tx_id)?;
        wtxn.commit()?;

        for (key, value) in updated {
            if value == 0 {
                self.cache.remove(&key);
            } else {
                self.cache.insert(key, value);
            }
        }
        self.last_applied_tx.store(tx_id, Ordering::SeqCst);
        Ok(true)
    }

    /// Replace all counters, e.g. after recovery
    pub fn rebuild(&self, counts: &BTreeMap<CountsKey, i64>, last_tx: u64) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.counts.clear(&mut wtxn)?;
        for (key, value) in counts.iter().filter(|(_, v)| **v != 0) {
            self.counts.put(&mut wtxn, key, value)?;
        }
        self.meta.put(&mut wtxn, LAST_TX_KEY, &last_tx)?;
        wtxn.commit()?;
        self.load()?;
        tracing::info!("Rebuilt counts store: {} counters at tx {}", self.cache.len(), last_tx);
        Ok(())
    }

    /// Snapshot of all non-zero counters
    pub fn snapshot(&self) -> BTreeMap<CountsKey, i64> {
        self.cache.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}
