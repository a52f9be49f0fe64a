//! Record storage engine
//!
//! Owns the record stores and everything derived from them (label scan
//! store, schema indexes, counts, schema cache, token caches) and exposes the
//! two halves of the write path:
//!
//! - [`RecordStorageEngine::create_commands`] turns a transaction's logical
//!   state into storage commands, enforcing constraints and computing count
//!   deltas on the way.
//! - [`RecordStorageEngine::apply`] writes batches of committed commands
//!   through a composition of appliers chosen by the application mode.
//!
//! Lifecycle: `open` → `init` → `start` → (`stop`) → `shutdown`.

pub mod reader;

pub use reader::{CommandCreationContext, StorageReader, StoreRelationshipCursor};

use crate::apply::index::{IndexWorkSync, LabelScanWorkSync};
use crate::apply::{
    BatchTransactionApplier, BatchTransactionApplierFacade, CacheInvalidationBatchApplier,
    CountsBatchApplier, ExplicitIndexBatchApplier, HighIdBatchApplier, IndexBatchApplier,
    NeoStoreBatchApplier, TransactionApplicationMode, TransactionToApply, apply_batch,
};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::health::DatabaseHealth;
use crate::index::{IndexActivator, IndexingService, LABEL_SCAN_STORE, LabelScanStore, WorkSync};
use crate::lock::{LockGroup, LockService, NoLockService, ReentrantLockService, ResourceLocker};
use crate::record::{IntegrityValidator, TransactionRecordState, TransactionToRecordStateVisitor};
use crate::storage::counts::{self, CountsKey};
use crate::storage::schema::SchemaCache;
use crate::storage::{IdController, StoreFileMetadata, StoreType, Stores};
use crate::txstate::{
    ConstraintEnforcingVisitor, CountsRecordState, TransactionCountingStateVisitor,
    TransactionState, TxStateVisitorDecorator,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

static NO_RECORD_LOCKS: NoLockService = NoLockService;

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Stores open, nothing loaded
    Opened,
    /// Caches loaded
    Initialized,
    /// Accepting transactions
    Started,
    /// Stopped; may be started again
    Stopped,
    /// Stores closed
    Shutdown,
}

/// Record storage engine
pub struct RecordStorageEngine {
    dir: PathBuf,
    config: EngineConfig,
    stores: Arc<Stores>,
    schema_cache: Arc<SchemaCache>,
    label_scan: Arc<LabelScanStore>,
    indexing: Arc<IndexingService>,
    label_scan_sync: LabelScanWorkSync,
    index_sync: IndexWorkSync,
    lock_service: ReentrantLockService,
    id_controller: IdController,
    health: Arc<DatabaseHealth>,
    state: Mutex<EngineState>,
}

impl RecordStorageEngine {
    /// Open (or create) the stores under `dir`
    pub fn open<P: AsRef<Path>>(dir: P, config: &EngineConfig, health: Arc<DatabaseHealth>) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let stores = Arc::new(Stores::open(&dir, config)?);
        let label_scan = Arc::new(LabelScanStore::new(dir.join(LABEL_SCAN_STORE)));
        let indexing = Arc::new(IndexingService::new());

        Ok(Self {
            label_scan_sync: WorkSync::new(Arc::clone(&label_scan)),
            index_sync: WorkSync::new(Arc::clone(&indexing)),
            dir,
            config: config.clone(),
            stores,
            schema_cache: Arc::new(SchemaCache::new()),
            label_scan,
            indexing,
            lock_service: ReentrantLockService::new(),
            id_controller: IdController::new(),
            health,
            state: Mutex::new(EngineState::Opened),
        })
    }

    /// Database directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Health signal shared with the engine's owner
    pub fn health(&self) -> &Arc<DatabaseHealth> {
        &self.health
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Underlying stores
    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    /// Schema rules in effect
    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// Label scan store
    pub fn label_scan_store(&self) -> &Arc<LabelScanStore> {
        &self.label_scan
    }

    /// Schema index service
    pub fn indexing(&self) -> &Arc<IndexingService> {
        &self.indexing
    }

    /// Load caches: label scan store, tokens, schema rules, index definitions
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != EngineState::Opened {
            return Err(Error::invalid_state(format!("cannot init engine in state {:?}", *state)));
        }
        self.label_scan.init()?;
        if !self.stores.metadata().was_clean_shutdown() {
            tracing::warn!("Store at {:?} was not shut down cleanly", self.dir);
            self.label_scan.mark_for_rebuild();
        }
        self.stores.tokens().init_caches()?;
        self.load_schema_cache()?;
        self.indexing.init(self.schema_cache.rules());
        *state = EngineState::Initialized;
        tracing::info!("Initialized storage engine at {:?}", self.dir);
        Ok(())
    }

    /// Start accepting work: mark the stores in use, populate indexes,
    /// rebuild the label scan store if needed
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, EngineState::Initialized | EngineState::Stopped) {
            return Err(Error::invalid_state(format!("cannot start engine in state {:?}", *state)));
        }
        self.stores.make_store_ok()?;
        self.stores.counts().start();
        if let Err(e) = self.start_derived_stores() {
            tracing::error!("Failed to start storage engine at {:?}: {}", self.dir, e);
            self.id_controller.stop();
            self.stores.counts().stop();
            return Err(e);
        }
        *state = EngineState::Started;
        tracing::info!(
            "Started storage engine at {:?} (last committed tx {})",
            self.dir,
            self.last_committed_tx()
        );
        Ok(())
    }

    fn start_derived_stores(&self) -> Result<()> {
        self.label_scan.start(self.stores.nodes())?;
        self.indexing.start(&self.stores)?;
        self.id_controller.start();
        Ok(())
    }

    /// Stop accepting work
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != EngineState::Started {
            return Ok(());
        }
        self.id_controller.stop();
        self.stores.counts().stop();
        *state = EngineState::Stopped;
        tracing::info!("Stopped storage engine at {:?}", self.dir);
        Ok(())
    }

    /// Close indexes, then the stores. Idempotent, and safe after a failed start.
    pub fn shutdown(&self) -> Result<()> {
        self.stop()?;
        let mut state = self.state.lock();
        if *state == EngineState::Shutdown {
            return Ok(());
        }
        *state = EngineState::Shutdown;
        drop(state);

        let mut first_error = None;
        self.indexing.shutdown();
        if let Err(e) = self.label_scan.shutdown() {
            tracing::error!("Failed to shut down label scan store: {}", e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.stores.close() {
            tracing::error!("Failed to close stores: {}", e);
            first_error.get_or_insert(e);
        }
        tracing::info!("Shut down storage engine at {:?}", self.dir);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut down, logging failures instead of returning them
    pub fn force_close(&self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Ignoring failure while force-closing engine: {}", e);
        }
    }

    /// Reader over committed data
    pub fn new_reader(&self) -> StorageReader {
        StorageReader::new(
            Arc::clone(&self.stores),
            Arc::clone(&self.schema_cache),
            Arc::clone(&self.label_scan),
            Arc::clone(&self.indexing),
        )
    }

    /// Context reserving record ids for one transaction
    pub fn allocate_command_creation_context(&self) -> CommandCreationContext {
        CommandCreationContext::new(Arc::clone(&self.stores))
    }

    /// Append the commands for `state` to `commands`.
    ///
    /// Nothing is appended when any check fails: constraint violations,
    /// conflicts with a constraint committed after the transaction started,
    /// or lock failures.
    pub fn create_commands(
        &self,
        commands: &mut Vec<Command>,
        state: Option<&TransactionState>,
        reader: &StorageReader,
        locks: &dyn ResourceLocker,
        last_tx_when_started: u64,
        decorator: &dyn TxStateVisitorDecorator,
    ) -> Result<()> {
        let Some(state) = state else {
            return Ok(());
        };
        if self.config.read_only {
            return Err(Error::invalid_state("database is read-only"));
        }
        let validator = IntegrityValidator::new(self.stores.metadata(), &self.schema_cache);
        validator.validate_transaction_start_knowledge(last_tx_when_started)?;

        let mut record_state = TransactionRecordState::new(reader, locks);
        let mut counts = CountsRecordState::new();
        {
            let records = TransactionToRecordStateVisitor::new(&mut record_state, validator);
            let constraints = ConstraintEnforcingVisitor::new(Box::new(records), state, reader, locks);
            let decorated = decorator.decorate(Box::new(constraints));
            let mut counting = TransactionCountingStateVisitor::new(decorated, state, reader, &mut counts);
            state.accept(&mut counting)?;
        }

        let mut staged = Vec::new();
        record_state.extract_commands(&mut staged);
        counts.extract_commands(&mut staged);
        commands.extend(staged);
        Ok(())
    }

    fn applier<'a>(
        &'a self,
        mode: TransactionApplicationMode,
        activator: &'a IndexActivator,
    ) -> BatchTransactionApplierFacade<'a> {
        let version = mode.version();
        let lock_service: &dyn LockService = if mode.needs_record_locks() {
            &self.lock_service
        } else {
            &NO_RECORD_LOCKS
        };
        let mut appliers: Vec<Box<dyn BatchTransactionApplier + 'a>> = vec![Box::new(
            NeoStoreBatchApplier::new(&self.stores, &self.schema_cache, lock_service, version),
        )];
        if mode.needs_high_id_tracking() {
            appliers.push(Box::new(HighIdBatchApplier::new(&self.stores)));
        }
        if mode.needs_cache_invalidation() {
            appliers.push(Box::new(CacheInvalidationBatchApplier::new(
                self.stores.tokens(),
                version,
            )));
        }
        if mode.needs_auxiliary_stores() {
            appliers.push(Box::new(CountsBatchApplier::new(self.stores.counts())));
            appliers.push(Box::new(IndexBatchApplier::new(
                &self.stores,
                &self.schema_cache,
                &self.indexing,
                &self.label_scan_sync,
                &self.index_sync,
                activator,
            )));
            appliers.push(Box::new(ExplicitIndexBatchApplier::new(
                self.stores.explicit_indexes(),
            )));
        }
        BatchTransactionApplierFacade::new(appliers)
    }

    /// Names of the appliers used for `mode`, in dispatch order
    pub fn applier_names(&self, mode: TransactionApplicationMode) -> Vec<&'static str> {
        let activator = IndexActivator::new();
        self.applier(mode, &activator).applier_names()
    }

    /// Apply a batch of committed transactions.
    ///
    /// Fails with `StoreNotAvailable` once the health signal has panicked. A
    /// failure while applying panics the health signal. Record locks taken
    /// during the batch are released when it ends; indexes created by the
    /// batch are populated after a successful batch.
    pub fn apply(&self, batch: &[TransactionToApply], mode: TransactionApplicationMode) -> Result<()> {
        self.health.assert_healthy()?;
        self.stores.assert_open()?;
        let locks = LockGroup::new();
        let activator = IndexActivator::new();
        let result = {
            let mut facade = self.applier(mode, &activator);
            apply_batch(&mut facade, batch, &locks, &self.health)
        };
        locks.close();
        if result.is_ok() {
            activator.activate(&self.indexing, &self.stores);
        }
        result
    }

    /// Write every store to disk
    pub fn flush_and_force(&self) -> Result<()> {
        self.stores.assert_open()?;
        self.label_scan.force()?;
        self.indexing.force()?;
        self.stores.flush()?;
        tracing::debug!("Flushed stores at {:?}", self.dir);
        Ok(())
    }

    /// Files backing the engine
    pub fn list_storage_files(&self) -> Vec<StoreFileMetadata> {
        let mut files = self.stores.list_files();
        files.push(StoreFileMetadata {
            path: self.label_scan.path().to_path_buf(),
            store_type: StoreType::LabelScan,
            record_size: None,
        });
        files
    }

    /// Identity of the store
    pub fn store_id(&self) -> Uuid {
        self.stores.metadata().store_id()
    }

    /// Highest transaction applied to the stores
    pub fn last_committed_tx(&self) -> u64 {
        self.stores.metadata().last_committed_tx()
    }

    /// Reload the schema cache from the schema store
    pub fn load_schema_cache(&self) -> Result<()> {
        let rules = self.stores.schema().load_all_rules()?;
        for rule in &rules {
            self.stores.schema().mark_used(rule.id);
        }
        tracing::debug!("Loaded {} schema rules", rules.len());
        self.schema_cache.load(rules);
        Ok(())
    }

    /// Drop freed ids that have not been released for reuse
    pub fn clear_buffered_ids(&self) {
        self.id_controller.clear(self.stores.id_generators());
    }

    /// Release buffered ids for reuse; returns how many were released
    pub fn maintenance(&self) -> usize {
        self.id_controller.maintenance(self.stores.id_generators())
    }

    /// Whether the previous session ended without a clean shutdown
    pub fn recovery_required(&self) -> bool {
        !self.stores.metadata().was_clean_shutdown()
    }

    /// Get ready for log replay: forget buffered ids and schedule a label scan rebuild
    pub fn prepare_for_recovery_required(&self) {
        self.clear_buffered_ids();
        self.label_scan.mark_for_rebuild();
    }

    /// Recompute counts, the label scan store and all indexes from the record stores
    pub fn rebuild_derived_stores(&self) -> Result<()> {
        let stores = &self.stores;
        let mut totals: BTreeMap<CountsKey, i64> = BTreeMap::new();
        stores.nodes().for_each_in_use(|_, node| {
            counts::node_deltas(&mut totals, &node.labels(), 1);
            Ok(())
        })?;
        stores.relationships().for_each_in_use(|_, rel| {
            let start = stores
                .nodes()
                .read_in_use(rel.first_node)?
                .map(|n| n.labels())
                .unwrap_or_default();
            let end = stores
                .nodes()
                .read_in_use(rel.second_node)?
                .map(|n| n.labels())
                .unwrap_or_default();
            counts::relationship_deltas(&mut totals, &start, rel.type_id, &end, 1);
            Ok(())
        })?;
        stores.counts().rebuild(&totals, self.last_committed_tx())?;
        self.label_scan.rebuild(stores.nodes())?;
        // replay may have created or dropped index rules
        self.indexing.init(self.schema_cache.rules());
        self.indexing.rebuild_all(stores);
        tracing::info!("Rebuilt derived stores at {:?}", self.dir);
        Ok(())
    }
}

impl std::fmt::Debug for RecordStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStorageEngine")
            .field("dir", &self.dir)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::token::TokenKind;
    use crate::testing::test_config;
    use crate::txstate::NoDecoration;
    use crate::lock::LockManager;
    use tempfile::TempDir;

    fn create_test_engine() -> (RecordStorageEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine =
            RecordStorageEngine::open(dir.path(), &test_config(), Arc::new(DatabaseHealth::new()))
                .unwrap();
        engine.init().unwrap();
        engine.start().unwrap();
        (engine, dir)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (engine, _dir) = create_test_engine();
        assert_eq!(engine.state(), EngineState::Started);
        assert!(engine.init().is_err());
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.start().unwrap();
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
    }

    #[test]
    fn test_shutdown_without_start() {
        let dir = TempDir::new().unwrap();
        let engine =
            RecordStorageEngine::open(dir.path(), &test_config(), Arc::new(DatabaseHealth::new()))
                .unwrap();
        engine.shutdown().unwrap();
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_shutdown_after_failed_start() {
        let dir = TempDir::new().unwrap();
        let engine =
            RecordStorageEngine::open(dir.path(), &test_config(), Arc::new(DatabaseHealth::new()))
                .unwrap();
        engine.init().unwrap();
        assert!(engine.label_scan_store().needs_rebuild());

        // a non-empty directory where the rebuilt label scan store must go
        let blocker = dir.path().join(LABEL_SCAN_STORE);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("occupied"), b"x").unwrap();

        assert!(engine.start().is_err());
        assert_eq!(engine.state(), EngineState::Initialized);
        assert!(!engine.stores().counts().is_started());
        assert!(!engine.id_controller.is_running());

        std::fs::remove_dir_all(&blocker).unwrap();
        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
        assert!(dir.path().join(LABEL_SCAN_STORE).is_file());
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_applier_composition_per_mode() {
        let (engine, _dir) = create_test_engine();
        assert_eq!(
            engine.applier_names(TransactionApplicationMode::Internal),
            vec!["neo-store", "counts", "index", "explicit-index"]
        );
        assert_eq!(
            engine.applier_names(TransactionApplicationMode::External),
            vec!["neo-store", "high-id", "cache-invalidation", "counts", "index", "explicit-index"]
        );
        assert_eq!(
            engine.applier_names(TransactionApplicationMode::Recovery),
            vec!["neo-store", "high-id", "cache-invalidation"]
        );
        assert_eq!(
            engine.applier_names(TransactionApplicationMode::ReverseRecovery),
            vec!["neo-store", "cache-invalidation"]
        );
    }

    #[test]
    fn test_create_commands_without_state_is_noop() {
        let (engine, _dir) = create_test_engine();
        let manager = Arc::new(LockManager::new(std::time::Duration::from_secs(1)));
        let client = manager.new_client();
        let reader = engine.new_reader();
        let mut commands = Vec::new();
        engine
            .create_commands(&mut commands, None, &reader, &client, 0, &NoDecoration)
            .unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn test_create_and_apply_node() {
        let (engine, _dir) = create_test_engine();
        let manager = Arc::new(LockManager::new(std::time::Duration::from_secs(1)));
        let client = manager.new_client();
        let reader = engine.new_reader();

        let label = engine.stores().tokens().holder(TokenKind::Label).reserve_id().unwrap();
        let node = reader.command_creation_context().reserve_node();
        let mut state = TransactionState::new();
        state.token_do_create(TokenKind::Label, label, "Person");
        state.node_do_create(node);
        state.node_do_add_label(node, label);

        let mut commands = Vec::new();
        engine
            .create_commands(&mut commands, Some(&state), &reader, &client, 0, &NoDecoration)
            .unwrap();
        assert!(commands.iter().any(|c| matches!(c, Command::LabelToken(_))));
        assert!(commands.iter().any(|c| matches!(c, Command::NodeCount { .. })));

        engine
            .apply(&[TransactionToApply::new(1, commands)], TransactionApplicationMode::Internal)
            .unwrap();
        assert_eq!(reader.node_labels(node).unwrap(), vec![label]);
        assert_eq!(reader.nodes_with_label(label), vec![node]);
        assert_eq!(reader.count_nodes(label), 1);
        assert_eq!(reader.node_count(), 1);
    }

    #[test]
    fn test_apply_refused_after_panic() {
        let (engine, _dir) = create_test_engine();
        engine.health().panic(&Error::internal("boom"));
        let err = engine
            .apply(&[TransactionToApply::new(1, Vec::new())], TransactionApplicationMode::Internal)
            .unwrap_err();
        assert!(matches!(err, Error::StoreNotAvailable(_)));
    }

    #[test]
    fn test_read_only_refuses_commands() {
        let dir = TempDir::new().unwrap();
        let engine = RecordStorageEngine::open(
            dir.path(),
            &test_config().with_read_only(true),
            Arc::new(DatabaseHealth::new()),
        )
        .unwrap();
        engine.init().unwrap();
        engine.start().unwrap();
        let manager = Arc::new(LockManager::new(std::time::Duration::from_secs(1)));
        let client = manager.new_client();
        let reader = engine.new_reader();
        let mut state = TransactionState::new();
        state.node_do_create(0);
        let mut commands = Vec::new();
        assert!(engine
            .create_commands(&mut commands, Some(&state), &reader, &client, 0, &NoDecoration)
            .is_err());
        assert!(commands.is_empty());
    }

    #[test]
    fn test_list_storage_files_includes_label_scan() {
        let (engine, _dir) = create_test_engine();
        let files = engine.list_storage_files();
        assert!(files.iter().any(|f| f.store_type == StoreType::LabelScan));
        assert_eq!(files.len(), 6);
    }
}
