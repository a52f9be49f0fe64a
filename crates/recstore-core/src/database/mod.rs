//! Graph database
//!
//! Ties the storage engine, the transaction log and the lock manager
//! together. Opening a database replays the log tail the stores have not
//! seen yet; committing a transaction creates its commands, appends them to
//! the log and applies them, in transaction id order.

use crate::apply::{TransactionApplicationMode, TransactionToApply};
use crate::config::EngineConfig;
use crate::engine::{RecordStorageEngine, StorageReader};
use crate::health::DatabaseHealth;
use crate::lock::{LockClientSession, LockManager};
use crate::storage::token::TokenKind;
use crate::transaction::KernelTransaction;
use crate::txstate::{NoDecoration, TransactionState};
use crate::wal::{LogEntry, TransactionLog};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An open graph database
pub struct GraphDatabase {
    config: EngineConfig,
    engine: RecordStorageEngine,
    log: TransactionLog,
    lock_manager: Arc<LockManager>,
    health: Arc<DatabaseHealth>,
    commit_lock: Mutex<()>,
    token_lock: Mutex<()>,
    closed: AtomicBool,
}

impl GraphDatabase {
    /// Open (or create) a database in `dir`, recovering from the log if needed
    pub fn open<P: AsRef<Path>>(dir: P, config: EngineConfig) -> Result<Self> {
        let health = Arc::new(DatabaseHealth::new());
        let engine = RecordStorageEngine::open(dir.as_ref(), &config, Arc::clone(&health))?;
        let log = match Self::start_engine(&engine, &config) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!("Failed to open database at {:?}: {}", dir.as_ref(), e);
                engine.force_close();
                return Err(e);
            }
        };

        let lock_manager = Arc::new(LockManager::new(config.lock_acquisition_timeout()));
        tracing::info!(
            "Opened database at {:?} (store {}, last committed tx {})",
            engine.dir(),
            engine.store_id(),
            engine.last_committed_tx()
        );
        Ok(Self {
            config,
            engine,
            log,
            lock_manager,
            health,
            commit_lock: Mutex::new(()),
            token_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn start_engine(engine: &RecordStorageEngine, config: &EngineConfig) -> Result<TransactionLog> {
        engine.init()?;
        let log = TransactionLog::open(engine.dir())?;
        let recovered = Self::recover(engine, &log, config)?;
        engine.start()?;
        if recovered > 0 {
            engine.rebuild_derived_stores()?;
        }
        Ok(log)
    }

    /// Replay log entries newer than the stores; returns how many were replayed
    fn recover(engine: &RecordStorageEngine, log: &TransactionLog, config: &EngineConfig) -> Result<usize> {
        let last = engine.last_committed_tx();
        let entries = log.read_entries_after(last)?;
        if entries.is_empty() {
            if engine.recovery_required() {
                tracing::info!("Unclean shutdown detected; log holds nothing after tx {}", last);
            }
            return Ok(0);
        }
        if config.read_only {
            return Err(Error::invalid_state(format!(
                "{} transactions need recovery but the database is read-only",
                entries.len()
            )));
        }

        tracing::info!(
            "Recovering {} transactions after tx {} from {:?}",
            entries.len(),
            last,
            log.path()
        );
        engine.prepare_for_recovery_required();
        let count = entries.len();
        for entry in entries {
            let tx = TransactionToApply::from(entry);
            engine.apply(std::slice::from_ref(&tx), TransactionApplicationMode::Recovery)?;
            engine.stores().metadata().transaction_committed(tx.tx_id)?;
        }
        tracing::info!("Recovery complete; last committed tx {}", engine.last_committed_tx());
        Ok(count)
    }

    /// Configuration the database was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage engine
    pub fn engine(&self) -> &RecordStorageEngine {
        &self.engine
    }

    /// The transaction log
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Lock manager handing out transaction lock clients
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Health signal
    pub fn health(&self) -> &Arc<DatabaseHealth> {
        &self.health
    }

    /// Highest committed transaction id
    pub fn last_committed_tx(&self) -> u64 {
        self.engine.last_committed_tx()
    }

    /// Reader over committed data
    pub fn new_reader(&self) -> StorageReader {
        self.engine.new_reader()
    }

    fn assert_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreNotAvailable("database is closed".to_string()));
        }
        self.health.assert_healthy()
    }

    /// Begin a write transaction
    pub fn begin_tx(&self) -> Result<KernelTransaction<'_>> {
        self.assert_open()?;
        Ok(KernelTransaction::new(
            self,
            self.lock_manager.new_client(),
            self.engine.new_reader(),
            self.last_committed_tx(),
        ))
    }

    /// Commit a transaction state; None if it changes nothing
    pub(crate) fn commit_state(
        &self,
        state: &TransactionState,
        reader: &StorageReader,
        locks: &LockClientSession,
        last_tx_when_started: u64,
    ) -> Result<Option<u64>> {
        if !state.has_changes() {
            return Ok(None);
        }
        self.assert_open()?;

        let mut commands = Vec::new();
        self.engine.create_commands(
            &mut commands,
            Some(state),
            reader,
            locks,
            last_tx_when_started,
            &NoDecoration,
        )?;

        let _commit = self.commit_lock.lock();
        let tx_id = self.log.last_tx_id().max(self.last_committed_tx()) + 1;
        let tx = TransactionToApply::new(tx_id, commands);
        self.log.append(&LogEntry::from(&tx))?;
        if self.config.force_log_on_commit {
            self.log.force()?;
        }
        self.engine
            .apply(std::slice::from_ref(&tx), TransactionApplicationMode::Internal)?;
        self.engine
            .stores()
            .metadata()
            .transaction_committed(tx_id)?;

        // internal application leaves the token caches alone
        let tokens = self.engine.stores().tokens();
        for token in state.created_tokens() {
            tokens.holder(token.kind).add_to_cache(token.id, &token.name);
        }
        tracing::debug!("Committed transaction {} ({} commands)", tx_id, tx.commands.len());
        Ok(Some(tx_id))
    }

    /// Apply transactions committed elsewhere, in id order
    pub fn apply_external(&self, batch: &[TransactionToApply]) -> Result<()> {
        self.assert_open()?;
        let _commit = self.commit_lock.lock();
        let mut expected = self.log.last_tx_id().max(self.last_committed_tx()) + 1;
        for tx in batch {
            if tx.tx_id != expected {
                return Err(Error::invalid_state(format!(
                    "external transaction {} out of order, expected {}",
                    tx.tx_id, expected
                )));
            }
            expected += 1;
        }
        for tx in batch {
            self.log.append(&LogEntry::from(tx))?;
        }
        self.log.force()?;
        self.engine.apply(batch, TransactionApplicationMode::External)?;
        if let Some(last) = batch.last() {
            self.engine
                .stores()
                .metadata()
                .transaction_committed(last.tx_id)?;
        }
        tracing::debug!("Applied {} external transactions", batch.len());
        Ok(())
    }

    fn get_or_create_token(&self, kind: TokenKind, name: &str) -> Result<u32> {
        let holder = self.engine.stores().tokens().holder(kind);
        if let Some(id) = holder.id_of(name) {
            return Ok(id);
        }
        let _token = self.token_lock.lock();
        if let Some(id) = holder.id_of(name) {
            return Ok(id);
        }
        let id = holder.reserve_id()?;
        let mut state = TransactionState::new();
        state.token_do_create(kind, id, name);
        let locks = self.lock_manager.new_client();
        let reader = self.engine.new_reader();
        self.commit_state(&state, &reader, &locks, self.last_committed_tx())?;
        tracing::debug!("Created {:?} token '{}' with id {}", kind, name, id);
        Ok(id)
    }

    /// Label id for `name`, created if missing
    pub fn label(&self, name: &str) -> Result<u32> {
        self.get_or_create_token(TokenKind::Label, name)
    }

    /// Relationship type id for `name`, created if missing
    pub fn relationship_type(&self, name: &str) -> Result<u32> {
        self.get_or_create_token(TokenKind::RelationshipType, name)
    }

    /// Property key id for `name`, created if missing
    pub fn property_key(&self, name: &str) -> Result<u32> {
        self.get_or_create_token(TokenKind::PropertyKey, name)
    }

    /// Flush every store and the log
    pub fn flush(&self) -> Result<()> {
        self.log.force()?;
        self.engine.flush_and_force()
    }

    /// Shut down cleanly. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let forced = self.log.force();
        let shutdown = self.engine.shutdown();
        tracing::info!("Closed database at {:?}", self.engine.dir());
        forced.and(shutdown)
    }

    /// Drop the database without a clean shutdown, as a process crash would
    pub fn crash(self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::warn!("Simulating crash of database at {:?}", self.engine.dir());
    }
}

impl Drop for GraphDatabase {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close database: {}", e);
        }
    }
}

impl std::fmt::Debug for GraphDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDatabase")
            .field("engine", &self.engine)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
