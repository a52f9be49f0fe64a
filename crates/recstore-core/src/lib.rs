//! Recstore Core - Record Storage Engine for a Property Graph
//!
//! This crate implements the storage layer of a property graph database:
//! - Fixed-size record stores for nodes, relationships, properties and strings
//! - Transactions that turn logical changes into record commands at commit
//! - A batch applier that writes commands through an ordered set of appliers
//!   (records, id tracking, cache invalidation, counts, indexes), chosen by
//!   the application mode
//! - Two-phase locking of a node and all of its neighbours before detaching it
//! - A health signal that stops all writes after a failed apply
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      GraphDatabase / KernelTransaction       │
//! │   (tx state, locks, commit, recovery, log)   │
//! └──────────────┬──────────────────────────────┘
//!                │ create_commands / apply
//! ┌──────────────┴──────────────────────────────┐
//! │          RecordStorageEngine                 │
//! │  (visitor chain, applier facade, lifecycle)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │     Derived stores (via WorkSync)            │
//! │  (label scan, property indexes, counts)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │           Storage Layer                      │
//! │  (record stores, catalog, transaction log)   │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod command;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod health;
pub mod index;
pub mod lock;
pub mod record;
pub mod storage;
pub mod testing;
pub mod transaction;
pub mod txstate;
pub mod wal;

pub use config::EngineConfig;
pub use database::GraphDatabase;
pub use engine::RecordStorageEngine;
pub use error::{Error, Result};
pub use health::DatabaseHealth;
pub use transaction::KernelTransaction;
