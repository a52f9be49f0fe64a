//! Checks that must pass before any command of a transaction is produced

use crate::storage::metadata::MetaDataStore;
use crate::storage::schema::{SchemaCache, SchemaRule};
use crate::{Error, Result};

/// Validates a transaction against committed schema state
#[derive(Clone, Copy)]
pub struct IntegrityValidator<'a> {
    metadata: &'a MetaDataStore,
    schema_cache: &'a SchemaCache,
}

impl<'a> IntegrityValidator<'a> {
    /// Validator over the given stores
    pub fn new(metadata: &'a MetaDataStore, schema_cache: &'a SchemaCache) -> Self {
        Self {
            metadata,
            schema_cache,
        }
    }

    /// Fail if a constraint was introduced after the transaction started.
    ///
    /// Such a transaction never saw the constraint and may have written
    /// data that violates it.
    pub fn validate_transaction_start_knowledge(&self, last_committed_tx_when_started: u64) -> Result<()> {
        let latest = self.metadata.latest_constraint_introducing_tx();
        if latest > last_committed_tx_when_started {
            return Err(Error::TransactionConflict(format!(
                "Database constraints have changed (txId={}) after this transaction (txId={}) started. \
                 Retry the transaction so that all constraints are checked.",
                latest, last_committed_tx_when_started
            )));
        }
        Ok(())
    }

    /// Fail if an equivalent rule already exists
    pub fn validate_schema_rule(&self, rule: &SchemaRule) -> Result<()> {
        if let Some(existing) = self.schema_cache.find_equivalent(rule) {
            if existing.id != rule.id {
                return Err(Error::constraint_violation(format!(
                    "An equivalent schema rule already exists with id {}",
                    existing.id
                )));
            }
        }
        Ok(())
    }
}
