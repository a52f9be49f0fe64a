//! Storage commands
//!
//! A committed transaction is a list of commands. Record commands carry both
//! the before and the after image of the record so that an applier can
//! write either version: the after image normally, the before image when
//! undoing during reverse recovery.

use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::property::PropertyValue;
use crate::storage::record::{DynamicRecord, NodeRecord, PropertyRecord, Record, RelationshipRecord};
use crate::storage::schema::SchemaRule;
use crate::storage::token::{LabelId, TypeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which image of a record command to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandVersion {
    /// Pre-transaction image
    Before,
    /// Post-transaction image
    After,
}

impl CommandVersion {
    /// Pick the image matching this version
    pub fn select<'r, T>(&self, before: &'r T, after: &'r T) -> &'r T {
        match self {
            CommandVersion::Before => before,
            CommandVersion::After => after,
        }
    }
}

/// Kind of change a record command makes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandMode {
    /// Record goes from unused to in use
    Create,
    /// Record stays in use
    Update,
    /// Record goes from in use to unused
    Delete,
}

impl CommandMode {
    /// Classify a before/after pair
    pub fn of<R: Record>(before: &R, after: &R) -> Self {
        match (before.in_use(), after.in_use()) {
            (false, true) => CommandMode::Create,
            (true, false) => CommandMode::Delete,
            _ => CommandMode::Update,
        }
    }
}

/// Node record change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    /// Node id
    pub id: u64,
    /// Image before the transaction
    pub before: NodeRecord,
    /// Image after the transaction
    pub after: NodeRecord,
}

/// Relationship record change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCommand {
    /// Relationship id
    pub id: u64,
    /// Image before the transaction
    pub before: RelationshipRecord,
    /// Image after the transaction
    pub after: RelationshipRecord,
}

/// Owner of a property chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyOwner {
    /// Node property
    Node(u64),
    /// Relationship property
    Relationship(u64),
}

/// Change to one string block of a property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicRecordChange {
    /// Block id
    pub id: u64,
    /// Image before the transaction
    pub before: DynamicRecord,
    /// Image after the transaction
    pub after: DynamicRecord,
}

/// Property record change, with decoded values for index maintenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCommand {
    /// Property record id
    pub id: u64,
    /// Entity owning the property
    pub owner: PropertyOwner,
    /// Image before the transaction
    pub before: PropertyRecord,
    /// Image after the transaction
    pub after: PropertyRecord,
    /// Value before the transaction, if the record was in use
    pub before_value: Option<PropertyValue>,
    /// Value after the transaction, if the record is in use
    pub after_value: Option<PropertyValue>,
    /// String blocks written or freed along with the record
    pub value_records: Vec<DynamicRecordChange>,
}

/// Token creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCommand {
    /// Token id
    pub id: u32,
    /// Token name
    pub name: String,
}

/// Schema rule change; `before`/`after` is None when the rule is absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCommand {
    /// Rule id
    pub id: u64,
    /// Rule before the transaction
    pub before: Option<SchemaRule>,
    /// Rule after the transaction
    pub after: Option<SchemaRule>,
}

/// A storage command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Node record change
    Node(NodeCommand),
    /// Relationship record change
    Relationship(RelationshipCommand),
    /// Property record change
    Property(PropertyCommand),
    /// New label token
    LabelToken(TokenCommand),
    /// New relationship type token
    RelationshipTypeToken(TokenCommand),
    /// New property key token
    PropertyKeyToken(TokenCommand),
    /// Schema rule change
    Schema(SchemaCommand),
    /// Node counter delta
    NodeCount {
        /// Label or `ANY`
        label: LabelId,
        /// Delta
        delta: i64,
    },
    /// Relationship counter delta
    RelationshipCount {
        /// Start label or `ANY`
        start_label: LabelId,
        /// Type or `ANY`
        type_id: TypeId,
        /// End label or `ANY`
        end_label: LabelId,
        /// Delta
        delta: i64,
    },
    /// Explicit index change
    ExplicitIndex(ExplicitIndexCommand),
}

impl Command {
    /// Mode of a record command; None for other commands
    pub fn mode(&self) -> Option<CommandMode> {
        match self {
            Command::Node(c) => Some(CommandMode::of(&c.before, &c.after)),
            Command::Relationship(c) => Some(CommandMode::of(&c.before, &c.after)),
            Command::Property(c) => Some(CommandMode::of(&c.before, &c.after)),
            _ => None,
        }
    }

    /// Whether the command changes a graph record
    pub fn is_record_command(&self) -> bool {
        self.mode().is_some()
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Node(_) => "node",
            Command::Relationship(_) => "relationship",
            Command::Property(_) => "property",
            Command::LabelToken(_) => "label-token",
            Command::RelationshipTypeToken(_) => "relationship-type-token",
            Command::PropertyKeyToken(_) => "property-key-token",
            Command::Schema(_) => "schema",
            Command::NodeCount { .. } => "node-count",
            Command::RelationshipCount { .. } => "relationship-count",
            Command::ExplicitIndex(_) => "explicit-index",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Node(c) => write!(f, "Node[{}]", c.id),
            Command::Relationship(c) => write!(f, "Relationship[{}]", c.id),
            Command::Property(c) => write!(f, "Property[{} of {:?}]", c.id, c.owner),
            Command::LabelToken(t) => write!(f, "LabelToken[{}:{}]", t.id, t.name),
            Command::RelationshipTypeToken(t) => write!(f, "RelationshipTypeToken[{}:{}]", t.id, t.name),
            Command::PropertyKeyToken(t) => write!(f, "PropertyKeyToken[{}:{}]", t.id, t.name),
            Command::Schema(c) => write!(f, "Schema[{}]", c.id),
            Command::NodeCount { label, delta } => write!(f, "NodeCount[{}:{:+}]", label, delta),
            Command::RelationshipCount {
                start_label,
                type_id,
                end_label,
                delta,
            } => write!(
                f,
                "RelationshipCount[({})-[{}]->({}):{:+}]",
                start_label, type_id, end_label, delta
            ),
            Command::ExplicitIndex(c) => write!(f, "ExplicitIndex[{}]", c.index_name()),
        }
    }
}
