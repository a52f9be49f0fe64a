//! Id bookkeeping for transactions whose ids were not reserved locally
//!
//! Local transactions reserve every id from the store's generator before
//! writing. External and recovered transactions arrive with ids already
//! chosen, so after the batch each generator is raised past the highest id
//! seen and every id left holding a live record is withdrawn from reuse.

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::Command;
use crate::lock::LockGroup;
use crate::storage::Stores;
use crate::storage::id_generator::IdGenerator;
use crate::storage::record::Record;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Ids written to one store during the batch, with whether the last write left them in use
#[derive(Debug, Default)]
struct Written {
    ids: BTreeMap<u64, bool>,
}

impl Written {
    fn track(&mut self, id: u64, in_use: bool) {
        self.ids.insert(id, in_use);
    }

    fn apply_to(&self, generator: &IdGenerator) {
        if let Some((&highest, _)) = self.ids.last_key_value() {
            generator.raise_high_id(highest);
        }
        let live: BTreeSet<u64> = self
            .ids
            .iter()
            .filter(|(_, in_use)| **in_use)
            .map(|(id, _)| *id)
            .collect();
        generator.mark_all_used(&live);
    }
}

#[derive(Debug, Default)]
struct Tracked {
    nodes: Written,
    relationships: Written,
    properties: Written,
    strings: Written,
    schema: Option<u64>,
}

/// Raises high ids and withdraws live ids from the free lists after the batch
pub struct HighIdBatchApplier<'a> {
    stores: &'a Stores,
    tracked: Tracked,
}

impl<'a> HighIdBatchApplier<'a> {
    /// Tracker over `stores`
    pub fn new(stores: &'a Stores) -> Self {
        Self {
            stores,
            tracked: Tracked::default(),
        }
    }
}

struct HighIdTransactionApplier<'b> {
    tracked: &'b mut Tracked,
}

impl TransactionApplier for HighIdTransactionApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        let tracked = &mut *self.tracked;
        match command {
            Command::Node(c) => tracked.nodes.track(c.id, c.after.in_use()),
            Command::Relationship(c) => tracked.relationships.track(c.id, c.after.in_use()),
            Command::Property(c) => {
                tracked.properties.track(c.id, c.after.in_use());
                for block in &c.value_records {
                    tracked.strings.track(block.id, block.after.in_use());
                }
            }
            Command::Schema(c) => {
                tracked.schema = Some(tracked.schema.map_or(c.id, |current| current.max(c.id)));
            }
            // token stores raise their own counters as tokens are stored
            _ => {}
        }
        Ok(())
    }
}

impl BatchTransactionApplier for HighIdBatchApplier<'_> {
    fn name(&self) -> &'static str {
        "high-id"
    }

    fn start_tx<'b>(
        &'b mut self,
        _tx: &'b TransactionToApply,
        _locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(HighIdTransactionApplier {
            tracked: &mut self.tracked,
        }))
    }

    fn close(&mut self) -> Result<()> {
        let tracked = std::mem::take(&mut self.tracked);
        tracked.nodes.apply_to(self.stores.nodes().ids());
        tracked.relationships.apply_to(self.stores.relationships().ids());
        tracked.properties.apply_to(self.stores.properties().ids());
        tracked.strings.apply_to(self.stores.strings().ids());
        if let Some(id) = tracked.schema {
            self.stores.schema().mark_used(id);
        }
        tracing::debug!(
            "High ids tracked: nodes={} relationships={} properties={} strings={}",
            self.stores.nodes().high_id(),
            self.stores.relationships().high_id(),
            self.stores.properties().high_id(),
            self.stores.strings().high_id()
        );
        Ok(())
    }
}
