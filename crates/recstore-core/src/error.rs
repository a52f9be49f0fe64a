//! Error types for the record storage engine

use thiserror::Error;

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the record storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Encoding or decoding of commands, log entries or catalog values failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage-related errors (record files, chains, id ranges)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Deadlock detected while waiting for a lock
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Lock could not be acquired before the configured timeout
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Constraint violation (uniqueness, existence, node still has relationships)
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Existing data prevents a new constraint from being created
    #[error("Unable to create constraint: {0}")]
    CreateConstraintFailure(String),

    /// Transaction conflicts with a concurrently committed transaction
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Node, relationship or schema rule not found
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Applying a committed batch failed; the engine has panicked
    #[error("Failed to apply transaction {tx_id}: {source}")]
    ApplyFailed {
        /// Id of the transaction whose application failed
        tx_id: u64,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// The engine refuses work after a panic or before start
    #[error("Store not available: {0}")]
    StoreNotAvailable(String),

    /// Operation invalid for the current lifecycle or transaction state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transaction usage errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a constraint violation error
    pub fn constraint_violation(msg: impl Into<String>) -> Self {
        Error::ConstraintViolation(msg.into())
    }

    /// Create an entity-not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::EntityNotFound(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Error::Transaction(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether retrying the whole transaction may succeed.
    ///
    /// Deadlocks, lock timeouts and conflicts with concurrently committed
    /// transactions are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Deadlock(_) | Error::LockTimeout(_) | Error::TransactionConflict(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
