//! Test helpers
//!
//! Small store sizes and a per-test directory keep tests fast and isolated.
//!
//! ```rust,no_run
//! use recstore_core::testing::setup_test_database;
//!
//! fn my_test() -> recstore_core::Result<()> {
//!     let (db, _ctx) = setup_test_database()?;
//!     let mut tx = db.begin_tx()?;
//!     tx.node_create()?;
//!     tx.commit()?;
//!     Ok(())
//! }
//! ```

mod context;

pub use context::TestContext;

use crate::config::EngineConfig;
use crate::database::GraphDatabase;
use crate::engine::RecordStorageEngine;
use crate::health::DatabaseHealth;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Configuration sized for tests: small files, short lock timeout, no fsync
pub fn test_config() -> EngineConfig {
    EngineConfig {
        initial_store_size: 4096,
        catalog_map_size: 8 * 1024 * 1024,
        force_log_on_commit: false,
        ..EngineConfig::default()
    }
    .with_lock_timeout(Duration::from_secs(2))
}

/// Open a database in a fresh temporary directory.
///
/// Keep the returned context alive for as long as the database is used.
pub fn setup_test_database() -> Result<(GraphDatabase, TestContext)> {
    let ctx = TestContext::new();
    let db = GraphDatabase::open(ctx.path(), test_config())?;
    Ok((db, ctx))
}

/// A started storage engine in a fresh temporary directory
pub fn setup_test_engine() -> Result<(RecordStorageEngine, TestContext)> {
    let ctx = TestContext::new();
    let engine = RecordStorageEngine::open(ctx.path(), &test_config(), Arc::new(DatabaseHealth::new()))?;
    engine.init()?;
    engine.start()?;
    Ok((engine, ctx))
}
