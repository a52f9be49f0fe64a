//! Applies explicit index commands when their transaction closes

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::Command;
use crate::lock::LockGroup;
use crate::storage::explicit_index::{ExplicitIndexCommand, ExplicitIndexStore};
use crate::Result;

/// Applier for the explicit index store
pub struct ExplicitIndexBatchApplier<'a> {
    store: &'a ExplicitIndexStore,
}

impl<'a> ExplicitIndexBatchApplier<'a> {
    /// Applier over `store`
    pub fn new(store: &'a ExplicitIndexStore) -> Self {
        Self { store }
    }
}

struct ExplicitIndexTransactionApplier<'b> {
    store: &'b ExplicitIndexStore,
    pending: Vec<ExplicitIndexCommand>,
}

impl TransactionApplier for ExplicitIndexTransactionApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        if let Command::ExplicitIndex(c) = command {
            self.pending.push(c.clone());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        self.store.apply(&pending)
    }
}

impl BatchTransactionApplier for ExplicitIndexBatchApplier<'_> {
    fn name(&self) -> &'static str {
        "explicit-index"
    }

    fn start_tx<'b>(
        &'b mut self,
        _tx: &'b TransactionToApply,
        _locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(ExplicitIndexTransactionApplier {
            store: self.store,
            pending: Vec::new(),
        }))
    }
}
