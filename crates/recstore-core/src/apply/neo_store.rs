//! Writes graph records, tokens and schema rules

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::{Command, CommandVersion, PropertyCommand, SchemaCommand, TokenCommand};
use crate::lock::{LockGroup, LockService};
use crate::storage::record::Record;
use crate::storage::record_store::RecordStore;
use crate::storage::schema::SchemaCache;
use crate::storage::token::TokenKind;
use crate::storage::Stores;
use crate::Result;

/// Applier for the record stores, token stores and schema store
pub struct NeoStoreBatchApplier<'a> {
    stores: &'a Stores,
    schema_cache: &'a SchemaCache,
    lock_service: &'a dyn LockService,
    version: CommandVersion,
}

impl<'a> NeoStoreBatchApplier<'a> {
    /// Applier writing the `version` image of record commands
    pub fn new(
        stores: &'a Stores,
        schema_cache: &'a SchemaCache,
        lock_service: &'a dyn LockService,
        version: CommandVersion,
    ) -> Self {
        Self {
            stores,
            schema_cache,
            lock_service,
            version,
        }
    }
}

impl BatchTransactionApplier for NeoStoreBatchApplier<'_> {
    fn name(&self) -> &'static str {
        "neo-store"
    }

    fn start_tx<'b>(
        &'b mut self,
        tx: &'b TransactionToApply,
        locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(NeoStoreTransactionApplier {
            stores: self.stores,
            schema_cache: self.schema_cache,
            lock_service: self.lock_service,
            version: self.version,
            tx_id: tx.tx_id,
            locks,
        }))
    }
}

struct NeoStoreTransactionApplier<'b> {
    stores: &'b Stores,
    schema_cache: &'b SchemaCache,
    lock_service: &'b dyn LockService,
    version: CommandVersion,
    tx_id: u64,
    locks: &'b LockGroup,
}

/// Write the selected image; ids that end up unused are freed when moving forward
fn write_record<R: Record>(
    store: &RecordStore<R>,
    version: CommandVersion,
    id: u64,
    before: &R,
    after: &R,
) -> Result<()> {
    let record = version.select(before, after);
    store.write(id, record)?;
    let released = match version {
        CommandVersion::After => before.in_use() && !after.in_use(),
        CommandVersion::Before => after.in_use() && !before.in_use(),
    };
    if released {
        store.ids().free_id(id);
    }
    Ok(())
}

impl NeoStoreTransactionApplier<'_> {
    fn apply_property(&self, command: &PropertyCommand) -> Result<()> {
        let strings = self.stores.strings();
        for block in &command.value_records {
            write_record(strings, self.version, block.id, &block.before, &block.after)?;
        }
        write_record(
            self.stores.properties(),
            self.version,
            command.id,
            &command.before,
            &command.after,
        )
    }

    fn apply_token(&self, kind: TokenKind, command: &TokenCommand) -> Result<()> {
        let holder = self.stores.tokens().holder(kind);
        match self.version {
            CommandVersion::After => holder.store_token(command.id, &command.name),
            CommandVersion::Before => holder.remove_token(command.id),
        }
    }

    fn apply_schema(&self, command: &SchemaCommand) -> Result<()> {
        let schema = self.stores.schema();
        match self.version.select(&command.before, &command.after) {
            Some(rule) => {
                schema.put(rule)?;
                self.schema_cache.add_schema_rule(rule.clone());
                if rule.is_constraint() && self.version == CommandVersion::After {
                    self.stores
                        .metadata()
                        .set_latest_constraint_introducing_tx(self.tx_id)?;
                }
            }
            None => {
                schema.delete(command.id)?;
                self.schema_cache.remove_schema_rule(command.id);
            }
        }
        Ok(())
    }
}

impl TransactionApplier for NeoStoreTransactionApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Node(c) => {
                self.locks.add(self.lock_service.acquire_node_lock(c.id));
                write_record(self.stores.nodes(), self.version, c.id, &c.before, &c.after)
            }
            Command::Relationship(c) => {
                self.locks.add(self.lock_service.acquire_relationship_lock(c.id));
                write_record(
                    self.stores.relationships(),
                    self.version,
                    c.id,
                    &c.before,
                    &c.after,
                )
            }
            Command::Property(c) => self.apply_property(c),
            Command::LabelToken(t) => self.apply_token(TokenKind::Label, t),
            Command::RelationshipTypeToken(t) => self.apply_token(TokenKind::RelationshipType, t),
            Command::PropertyKeyToken(t) => self.apply_token(TokenKind::PropertyKey, t),
            Command::Schema(c) => self.apply_schema(c),
            Command::NodeCount { .. }
            | Command::RelationshipCount { .. }
            | Command::ExplicitIndex(_) => Ok(()),
        }
    }
}
