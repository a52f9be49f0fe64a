//! Engine configuration
//!
//! Settings come from three layers, highest priority first:
//! environment variables (`RECSTORE_*`), a TOML file, then defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Size of the largest fixed-size record; store files must hold at least one.
const MAX_RECORD_SIZE: usize = 64;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Open the database read-only (no write transactions)
    pub read_only: bool,
    /// How long a lock client waits before failing with a lock timeout
    pub lock_acquisition_timeout_ms: u64,
    /// Initial size in bytes of each record store file
    pub initial_store_size: usize,
    /// LMDB map size in bytes for the catalog environment
    pub catalog_map_size: usize,
    /// fsync the transaction log on every commit
    pub force_log_on_commit: bool,
    /// Hand out freed record ids again once they have been released
    pub reuse_ids: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            lock_acquisition_timeout_ms: 5_000,
            initial_store_size: 1024 * 1024,
            catalog_map_size: 64 * 1024 * 1024,
            force_log_on_commit: true,
            reuse_ids: true,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from an optional file, then apply environment overrides.
    ///
    /// A missing file falls back to defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::debug!("Engine config file not found: {:?}", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RECSTORE_*` overrides using the given variable lookup
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("RECSTORE_READ_ONLY") {
            self.read_only = parse_env("RECSTORE_READ_ONLY", &value)?;
        }
        if let Some(value) = lookup("RECSTORE_LOCK_TIMEOUT_MS") {
            self.lock_acquisition_timeout_ms = parse_env("RECSTORE_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("RECSTORE_INITIAL_STORE_SIZE") {
            self.initial_store_size = parse_env("RECSTORE_INITIAL_STORE_SIZE", &value)?;
        }
        if let Some(value) = lookup("RECSTORE_CATALOG_MAP_SIZE") {
            self.catalog_map_size = parse_env("RECSTORE_CATALOG_MAP_SIZE", &value)?;
        }
        if let Some(value) = lookup("RECSTORE_FORCE_LOG_ON_COMMIT") {
            self.force_log_on_commit = parse_env("RECSTORE_FORCE_LOG_ON_COMMIT", &value)?;
        }
        if let Some(value) = lookup("RECSTORE_REUSE_IDS") {
            self.reuse_ids = parse_env("RECSTORE_REUSE_IDS", &value)?;
        }
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.lock_acquisition_timeout_ms == 0 {
            return Err(Error::config("lock_acquisition_timeout_ms must be positive"));
        }
        if self.initial_store_size < MAX_RECORD_SIZE {
            return Err(Error::config(format!(
                "initial_store_size must be at least {} bytes",
                MAX_RECORD_SIZE
            )));
        }
        if self.catalog_map_size < 1024 * 1024 {
            return Err(Error::config("catalog_map_size must be at least 1 MiB"));
        }
        Ok(())
    }

    /// Lock acquisition timeout as a Duration
    pub fn lock_acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquisition_timeout_ms)
    }

    /// Set read-only mode
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("invalid value {:?} for {}", value, key)))
}
