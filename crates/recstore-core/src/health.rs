//! Database health signal
//!
//! A failure while applying committed commands leaves the stores in an
//! unknown state. The engine reports it here; from then on every write
//! entry point refuses work with [`Error::StoreNotAvailable`] until the
//! database is reopened (which runs recovery).

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Coarse health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Accepting work
    Healthy,
    /// Panicked; refusing writes
    Panicked,
}

/// One-way healthy → panicked latch shared by the engine and its owners
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    panicked: AtomicBool,
    cause: Mutex<Option<String>>,
    panic_calls: AtomicU64,
}

impl DatabaseHealth {
    /// Create a healthy signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal failure.
    ///
    /// Returns true if this call moved the signal from healthy to panicked.
    /// The first cause is kept; later causes are only logged.
    pub fn panic(&self, cause: &Error) -> bool {
        self.panic_calls.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.cause.lock();
        if self
            .panicked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::error!("Database panicked: {}", cause);
            *slot = Some(cause.to_string());
            true
        } else {
            tracing::warn!("Database already panicked; additional failure: {}", cause);
            false
        }
    }

    /// Whether no panic has been recorded
    pub fn is_healthy(&self) -> bool {
        !self.panicked.load(Ordering::SeqCst)
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        if self.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Panicked
        }
    }

    /// Fail with `StoreNotAvailable` if the signal has panicked
    pub fn assert_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let cause = self
            .cause
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown cause".to_string());
        Err(Error::StoreNotAvailable(format!(
            "database has panicked and refuses further work: {}",
            cause
        )))
    }

    /// The first recorded panic cause
    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }

    /// Number of times `panic` has been called, including repeats
    pub fn panic_calls(&self) -> u64 {
        self.panic_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_starts_healthy() {
        let health = DatabaseHealth::new();
        assert!(health.is_healthy());
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert!(health.assert_healthy().is_ok());
        assert_eq!(health.cause(), None);
    }

    #[test]
    fn test_panic_is_one_way_and_keeps_first_cause() {
        let health = DatabaseHealth::new();
        assert!(health.panic(&Error::storage("first")));
        assert!(!health.panic(&Error::storage("second")));

        assert!(!health.is_healthy());
        assert_eq!(health.cause().unwrap(), "Storage error: first");
        assert_eq!(health.panic_calls(), 2);

        let err = health.assert_healthy().unwrap_err();
        assert!(matches!(err, Error::StoreNotAvailable(_)));
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_concurrent_panics_transition_once() {
        let health = Arc::new(DatabaseHealth::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let health = Arc::clone(&health);
                thread::spawn(move || health.panic(&Error::internal(format!("worker {}", i))))
            })
            .collect();

        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|moved| *moved)
            .count();
        assert_eq!(transitions, 1);
        assert_eq!(health.status(), HealthStatus::Panicked);
    }
}
