//! Command application
//!
//! A batch of committed transactions is applied by a
//! [`BatchTransactionApplierFacade`]: an ordered list of sub-appliers, each
//! responsible for one concern (graph records, high ids, token caches,
//! counts, schema indexes, explicit indexes). For every transaction of the
//! batch each sub-applier opens a [`TransactionApplier`], sees every command
//! and is closed before the next transaction starts.
//!
//! Which sub-appliers take part depends on the
//! [`TransactionApplicationMode`]. Any failure is fatal: the database health
//! is panicked and the batch fails with [`Error::ApplyFailed`].

pub mod cache_invalidation;
pub mod counts;
pub mod explicit_index;
pub mod high_id;
pub mod index;
pub mod neo_store;

pub use cache_invalidation::CacheInvalidationBatchApplier;
pub use counts::CountsBatchApplier;
pub use explicit_index::ExplicitIndexBatchApplier;
pub use high_id::HighIdBatchApplier;
pub use index::IndexBatchApplier;
pub use neo_store::NeoStoreBatchApplier;

use crate::command::{Command, CommandVersion};
use crate::health::DatabaseHealth;
use crate::lock::LockGroup;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// How a batch reaches the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionApplicationMode {
    /// Committed by this database
    Internal,
    /// Committed elsewhere and shipped here
    External,
    /// Replayed from the log on startup
    Recovery,
    /// Undone during recovery, applying before images
    ReverseRecovery,
}

impl TransactionApplicationMode {
    /// Whether record ids must be marked used (ids were not reserved here)
    pub fn needs_high_id_tracking(&self) -> bool {
        matches!(self, Self::External | Self::Recovery)
    }

    /// Whether token caches must follow the applied token commands
    pub fn needs_cache_invalidation(&self) -> bool {
        !matches!(self, Self::Internal)
    }

    /// Whether counts, schema indexes and explicit indexes are maintained
    pub fn needs_auxiliary_stores(&self) -> bool {
        matches!(self, Self::Internal | Self::External)
    }

    /// Whether record locks are taken while writing
    pub fn needs_record_locks(&self) -> bool {
        matches!(self, Self::Internal | Self::External)
    }

    /// Image of record commands to write
    pub fn version(&self) -> CommandVersion {
        match self {
            Self::ReverseRecovery => CommandVersion::Before,
            _ => CommandVersion::After,
        }
    }
}

/// One committed transaction ready to be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionToApply {
    /// Transaction id
    pub tx_id: u64,
    /// Commands in creation order
    pub commands: Vec<Command>,
    /// Commit time, milliseconds since the epoch
    pub commit_timestamp: i64,
}

impl TransactionToApply {
    /// Transaction committed now
    pub fn new(tx_id: u64, commands: Vec<Command>) -> Self {
        Self {
            tx_id,
            commands,
            commit_timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Applies the commands of one transaction
pub trait TransactionApplier {
    /// Handle one command
    fn visit(&mut self, command: &Command) -> Result<()>;

    /// All commands of the transaction have been visited
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One concern of batch application
pub trait BatchTransactionApplier {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Open an applier for the next transaction of the batch
    fn start_tx<'a>(
        &'a mut self,
        tx: &'a TransactionToApply,
        locks: &'a LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'a>>;

    /// The batch is complete
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ordered composition of batch appliers
pub struct BatchTransactionApplierFacade<'a> {
    appliers: Vec<Box<dyn BatchTransactionApplier + 'a>>,
}

impl<'a> BatchTransactionApplierFacade<'a> {
    /// Compose `appliers`; commands reach them in this order
    pub fn new(appliers: Vec<Box<dyn BatchTransactionApplier + 'a>>) -> Self {
        Self { appliers }
    }

    /// Names of the composed appliers, in order
    pub fn applier_names(&self) -> Vec<&'static str> {
        self.appliers.iter().map(|a| a.name()).collect()
    }

    /// Apply one transaction through every applier.
    ///
    /// Each command is handed to every applier before the next command;
    /// transaction appliers close in reverse order of opening.
    pub fn apply_transaction(&mut self, tx: &TransactionToApply, locks: &LockGroup) -> Result<()> {
        let mut appliers = Vec::with_capacity(self.appliers.len());
        for applier in self.appliers.iter_mut() {
            appliers.push(applier.start_tx(tx, locks)?);
        }
        for command in &tx.commands {
            for applier in appliers.iter_mut() {
                applier.visit(command)?;
            }
        }
        while let Some(mut applier) = appliers.pop() {
            applier.close()?;
        }
        Ok(())
    }

    /// Close every batch applier, in reverse order
    pub fn close(&mut self) -> Result<()> {
        for applier in self.appliers.iter_mut().rev() {
            applier.close()?;
        }
        Ok(())
    }
}

fn fatal(health: &DatabaseHealth, tx_id: u64, source: Error) -> Error {
    let error = Error::ApplyFailed {
        tx_id,
        source: Box::new(source),
    };
    health.panic(&error);
    error
}

/// Apply a batch in order and close the facade.
///
/// The first failure panics `health` and ends the batch; the remaining
/// transactions are not applied.
pub fn apply_batch(
    facade: &mut BatchTransactionApplierFacade<'_>,
    batch: &[TransactionToApply],
    locks: &LockGroup,
    health: &DatabaseHealth,
) -> Result<()> {
    for tx in batch {
        if let Err(e) = facade.apply_transaction(tx, locks) {
            return Err(fatal(health, tx.tx_id, e));
        }
    }
    if let Err(e) = facade.close() {
        let last = batch.last().map(|tx| tx.tx_id).unwrap_or(0);
        return Err(fatal(health, last, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: Log,
        fail_on: Option<u64>,
    }

    struct RecordingTx<'a> {
        name: &'static str,
        tx_id: u64,
        log: &'a Log,
        fail: bool,
    }

    impl TransactionApplier for RecordingTx<'_> {
        fn visit(&mut self, command: &Command) -> Result<()> {
            if self.fail {
                return Err(Error::storage(format!("{} rejects tx {}", self.name, self.tx_id)));
            }
            self.log
                .lock()
                .push(format!("{}:{}:{}", self.name, self.tx_id, command.kind()));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log.lock().push(format!("{}:{}:close", self.name, self.tx_id));
            Ok(())
        }
    }

    impl BatchTransactionApplier for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start_tx<'a>(
            &'a mut self,
            tx: &'a TransactionToApply,
            _locks: &'a LockGroup,
        ) -> Result<Box<dyn TransactionApplier + 'a>> {
            Ok(Box::new(RecordingTx {
                name: self.name,
                tx_id: tx.tx_id,
                log: &self.log,
                fail: self.fail_on == Some(tx.tx_id),
            }))
        }

        fn close(&mut self) -> Result<()> {
            self.log.lock().push(format!("{}:batch-close", self.name));
            Ok(())
        }
    }

    fn tx(tx_id: u64) -> TransactionToApply {
        TransactionToApply::new(
            tx_id,
            vec![Command::NodeCount {
                label: 0,
                delta: 1,
            }],
        )
    }

    #[test]
    fn test_mode_table() {
        use TransactionApplicationMode::*;
        assert!(!Internal.needs_high_id_tracking());
        assert!(External.needs_high_id_tracking());
        assert!(Recovery.needs_high_id_tracking());
        assert!(!ReverseRecovery.needs_high_id_tracking());

        assert!(!Internal.needs_cache_invalidation());
        assert!(ReverseRecovery.needs_cache_invalidation());

        assert!(Internal.needs_auxiliary_stores());
        assert!(External.needs_auxiliary_stores());
        assert!(!Recovery.needs_auxiliary_stores());
        assert!(!ReverseRecovery.needs_auxiliary_stores());

        assert_eq!(ReverseRecovery.version(), CommandVersion::Before);
        assert_eq!(Recovery.version(), CommandVersion::After);
    }

    #[test]
    fn test_commands_dispatched_in_order() {
        let log: Log = Arc::default();
        let mut facade = BatchTransactionApplierFacade::new(vec![
            Box::new(Recording {
                name: "a",
                log: Arc::clone(&log),
                fail_on: None,
            }),
            Box::new(Recording {
                name: "b",
                log: Arc::clone(&log),
                fail_on: None,
            }),
        ]);
        assert_eq!(facade.applier_names(), vec!["a", "b"]);

        let health = DatabaseHealth::new();
        apply_batch(&mut facade, &[tx(1), tx(2)], &LockGroup::new(), &health).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "a:1:node-count",
                "b:1:node-count",
                "b:1:close",
                "a:1:close",
                "a:2:node-count",
                "b:2:node-count",
                "b:2:close",
                "a:2:close",
                "b:batch-close",
                "a:batch-close",
            ]
        );
        assert!(health.is_healthy());
    }

    #[test]
    fn test_failure_panics_health_and_stops_batch() {
        let log: Log = Arc::default();
        let mut facade = BatchTransactionApplierFacade::new(vec![Box::new(Recording {
            name: "a",
            log: Arc::clone(&log),
            fail_on: Some(2),
        })]);
        let health = DatabaseHealth::new();

        let err = apply_batch(&mut facade, &[tx(1), tx(2), tx(3)], &LockGroup::new(), &health)
            .unwrap_err();
        match err {
            Error::ApplyFailed { tx_id, source } => {
                assert_eq!(tx_id, 2);
                assert!(source.to_string().contains("a rejects tx 2"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!health.is_healthy());
        assert_eq!(health.panic_calls(), 1);
        assert!(log.lock().iter().all(|entry| !entry.starts_with("a:3")));
    }
}
