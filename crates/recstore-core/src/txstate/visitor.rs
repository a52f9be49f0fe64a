//! Visitor over a transaction's logical changes

use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::schema::SchemaRule;
use crate::storage::token::TokenKind;
use crate::txstate::{LabelDiff, PropertyDiff, RelationshipData};
use crate::Result;

/// Receives the changes of a [`TransactionState`](crate::txstate::TransactionState)
///
/// Wrapping visitors forward every call to the visitor they wrap, after (or
/// before) doing their own work.
pub trait TxStateVisitor {
    /// A token was created
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()>;
    /// A node was created
    fn visit_created_node(&mut self, id: u64) -> Result<()>;
    /// A node was deleted
    fn visit_deleted_node(&mut self, id: u64) -> Result<()>;
    /// A relationship was created
    fn visit_created_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()>;
    /// A relationship was deleted
    fn visit_deleted_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()>;
    /// Labels of a node changed
    fn visit_node_label_changes(&mut self, id: u64, diff: &LabelDiff) -> Result<()>;
    /// Properties of a node changed
    fn visit_node_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()>;
    /// Properties of a relationship changed
    fn visit_relationship_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()>;
    /// A schema rule was added
    fn visit_added_schema_rule(&mut self, rule: &SchemaRule) -> Result<()>;
    /// A schema rule was dropped
    fn visit_removed_schema_rule(&mut self, rule: &SchemaRule) -> Result<()>;
    /// An explicit index operation
    fn visit_explicit_index(&mut self, command: &ExplicitIndexCommand) -> Result<()>;
    /// All changes have been visited
    fn close(&mut self) -> Result<()>;
}

/// Wraps the visitor chain built by command creation with extra visitors
pub trait TxStateVisitorDecorator {
    /// Return a visitor that forwards to `inner`
    fn decorate<'a>(&'a self, inner: Box<dyn TxStateVisitor + 'a>) -> Box<dyn TxStateVisitor + 'a>;
}

/// Decorator that adds nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecoration;

impl TxStateVisitorDecorator for NoDecoration {
    fn decorate<'a>(&'a self, inner: Box<dyn TxStateVisitor + 'a>) -> Box<dyn TxStateVisitor + 'a> {
        inner
    }
}
