//! Applies count deltas, one counts-store transaction per applied transaction

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::Command;
use crate::lock::LockGroup;
use crate::storage::counts::{CountsKey, CountsStore};
use crate::Result;
use std::collections::BTreeMap;

/// Applier for the counts store
pub struct CountsBatchApplier<'a> {
    counts: &'a CountsStore,
}

impl<'a> CountsBatchApplier<'a> {
    /// Applier over `counts`
    pub fn new(counts: &'a CountsStore) -> Self {
        Self { counts }
    }
}

struct CountsTransactionApplier<'b> {
    counts: &'b CountsStore,
    tx_id: u64,
    deltas: BTreeMap<CountsKey, i64>,
}

impl TransactionApplier for CountsTransactionApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match *command {
            Command::NodeCount { label, delta } => {
                *self.deltas.entry(CountsKey::node(label)).or_default() += delta;
            }
            Command::RelationshipCount {
                start_label,
                type_id,
                end_label,
                delta,
            } => {
                *self
                    .deltas
                    .entry(CountsKey::relationship(start_label, type_id, end_label))
                    .or_default() += delta;
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.counts.apply(self.tx_id, &self.deltas)?;
        Ok(())
    }
}

impl BatchTransactionApplier for CountsBatchApplier<'_> {
    fn name(&self) -> &'static str {
        "counts"
    }

    fn start_tx<'b>(
        &'b mut self,
        tx: &'b TransactionToApply,
        _locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(CountsTransactionApplier {
            counts: self.counts,
            tx_id: tx.tx_id,
            deltas: BTreeMap::new(),
        }))
    }
}
