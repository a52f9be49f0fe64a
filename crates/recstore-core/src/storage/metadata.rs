//! Store metadata: identity, last committed transaction, latest
//! constraint-introducing transaction and the clean-shutdown marker.

use crate::Result;
use heed::types::*;
use heed::{Database, Env};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const METADATA_KEY: &str = "main";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Persisted metadata record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Unique store identity
    pub store_id: Uuid,
    /// Creation time (milliseconds since epoch)
    pub created_at: i64,
    /// Store format version
    pub format_version: u32,
    /// Highest transaction applied to the stores
    pub last_committed_tx: u64,
    /// Highest transaction that created a constraint
    pub latest_constraint_tx: u64,
    /// Whether the stores were closed cleanly
    pub clean_shutdown: bool,
}

impl StoreMetadata {
    fn fresh() -> Self {
        Self {
            store_id: Uuid::new_v4(),
            created_at: chrono::Utc::now().timestamp_millis(),
            format_version: FORMAT_VERSION,
            last_committed_tx: 0,
            latest_constraint_tx: 0,
            clean_shutdown: true,
        }
    }
}

/// Metadata store backed by the catalog
pub struct MetaDataStore {
    env: Env,
    db: Database<Str, SerdeBincode<StoreMetadata>>,
    state: Mutex<StoreMetadata>,
    clean_at_open: bool,
}

impl MetaDataStore {
    /// Open, creating a fresh identity for a new store
    pub fn open(env: &Env) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let db: Database<Str, SerdeBincode<StoreMetadata>> =
            env.create_database(&mut wtxn, Some("store_metadata"))?;
        let state = match db.get(&wtxn, METADATA_KEY)? {
            Some(existing) => existing,
            None => {
                let fresh = StoreMetadata::fresh();
                db.put(&mut wtxn, METADATA_KEY, &fresh)?;
                tracing::info!("Created new store {}", fresh.store_id);
                fresh
            }
        };
        wtxn.commit()?;

        Ok(Self {
            env: env.clone(),
            db,
            clean_at_open: state.clean_shutdown,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StoreMetadata) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, METADATA_KEY, state)?;
        wtxn.commit()?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StoreMetadata)) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        f(&mut next);
        if next != *state {
            self.persist(&next)?;
            *state = next;
        }
        Ok(())
    }

    /// Snapshot of the metadata
    pub fn snapshot(&self) -> StoreMetadata {
        self.state.lock().clone()
    }

    /// Store identity
    pub fn store_id(&self) -> Uuid {
        self.state.lock().store_id
    }

    /// Highest committed transaction id
    pub fn last_committed_tx(&self) -> u64 {
        self.state.lock().last_committed_tx
    }

    /// Record a committed transaction; the value never decreases
    pub fn transaction_committed(&self, tx_id: u64) -> Result<()> {
        self.update(|m| m.last_committed_tx = m.last_committed_tx.max(tx_id))
    }

    /// Overwrite the last committed transaction id
    pub fn set_last_committed_tx(&self, tx_id: u64) -> Result<()> {
        self.update(|m| m.last_committed_tx = tx_id)
    }

    /// Highest transaction that introduced a constraint
    pub fn latest_constraint_introducing_tx(&self) -> u64 {
        self.state.lock().latest_constraint_tx
    }

    /// Record a constraint-introducing transaction
    pub fn set_latest_constraint_introducing_tx(&self, tx_id: u64) -> Result<()> {
        self.update(|m| m.latest_constraint_tx = m.latest_constraint_tx.max(tx_id))
    }

    /// Whether the previous session shut down cleanly
    pub fn was_clean_shutdown(&self) -> bool {
        self.clean_at_open
    }

    /// Mark the store as in use (not cleanly shut down)
    pub fn mark_in_use(&self) -> Result<()> {
        self.update(|m| m.clean_shutdown = false)
    }

    /// Mark the store as cleanly shut down
    pub fn mark_clean(&self) -> Result<()> {
        self.update(|m| m.clean_shutdown = true)
    }
}
