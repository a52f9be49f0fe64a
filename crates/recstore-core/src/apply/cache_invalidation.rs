//! Keeps token caches in line with applied token commands

use crate::apply::{BatchTransactionApplier, TransactionApplier, TransactionToApply};
use crate::command::{Command, CommandVersion};
use crate::lock::LockGroup;
use crate::storage::token::{TokenHolders, TokenKind};
use crate::Result;

/// Publishes applied tokens to the caches, or withdraws them when undoing
pub struct CacheInvalidationBatchApplier<'a> {
    tokens: &'a TokenHolders,
    version: CommandVersion,
}

impl<'a> CacheInvalidationBatchApplier<'a> {
    /// Applier over `tokens`
    pub fn new(tokens: &'a TokenHolders, version: CommandVersion) -> Self {
        Self { tokens, version }
    }
}

struct CacheInvalidationTransactionApplier<'b> {
    tokens: &'b TokenHolders,
    version: CommandVersion,
}

impl TransactionApplier for CacheInvalidationTransactionApplier<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        let (kind, token) = match command {
            Command::LabelToken(t) => (TokenKind::Label, t),
            Command::RelationshipTypeToken(t) => (TokenKind::RelationshipType, t),
            Command::PropertyKeyToken(t) => (TokenKind::PropertyKey, t),
            _ => return Ok(()),
        };
        let holder = self.tokens.holder(kind);
        match self.version {
            CommandVersion::After => holder.add_to_cache(token.id, &token.name),
            CommandVersion::Before => holder.remove_from_cache(token.id),
        }
        Ok(())
    }
}

impl BatchTransactionApplier for CacheInvalidationBatchApplier<'_> {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    fn start_tx<'b>(
        &'b mut self,
        _tx: &'b TransactionToApply,
        _locks: &'b LockGroup,
    ) -> Result<Box<dyn TransactionApplier + 'b>> {
        Ok(Box::new(CacheInvalidationTransactionApplier {
            tokens: self.tokens,
            version: self.version,
        }))
    }
}
