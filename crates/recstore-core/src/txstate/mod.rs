//! Logical transaction state
//!
//! [`TransactionState`] is the diff a transaction builds up before commit:
//! created and deleted entities, label and property changes, schema rule
//! changes, new tokens and explicit index operations. It knows nothing about
//! records. At commit it is walked once through a chain of
//! [`TxStateVisitor`]s that count, enforce constraints and finally turn it
//! into record changes.

pub mod constraints;
pub mod counting;
pub mod visitor;

pub use constraints::ConstraintEnforcingVisitor;
pub use counting::{CountsRecordState, TransactionCountingStateVisitor};
pub use visitor::{NoDecoration, TxStateVisitor, TxStateVisitorDecorator};

use crate::engine::StorageReader;
use crate::lock::Direction;
use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::property::PropertyValue;
use crate::storage::schema::SchemaRule;
use crate::storage::token::{KeyId, LabelId, TokenKind, TypeId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Endpoints and type of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipData {
    /// Start node
    pub start_node: u64,
    /// Relationship type
    pub type_id: TypeId,
    /// End node
    pub end_node: u64,
}

impl RelationshipData {
    /// Create relationship data
    pub fn new(start_node: u64, type_id: TypeId, end_node: u64) -> Self {
        Self {
            start_node,
            type_id,
            end_node,
        }
    }

    /// Whether `node` is an endpoint
    pub fn touches(&self, node: u64) -> bool {
        self.start_node == node || self.end_node == node
    }

    /// The endpoint that is not `node`
    pub fn other_node(&self, node: u64) -> u64 {
        if self.start_node == node {
            self.end_node
        } else {
            self.start_node
        }
    }

    /// Direction as seen from `node`
    pub fn direction_from(&self, node: u64) -> Direction {
        if self.start_node == self.end_node {
            Direction::Loop
        } else if self.start_node == node {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }
}

/// Labels added and removed on one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    /// Labels added
    pub added: BTreeSet<LabelId>,
    /// Labels removed
    pub removed: BTreeSet<LabelId>,
}

impl LabelDiff {
    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Apply the diff to a label set
    pub fn apply_to(&self, labels: &mut BTreeSet<LabelId>) {
        for label in &self.removed {
            labels.remove(label);
        }
        labels.extend(self.added.iter().copied());
    }
}

/// Properties set and removed on one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDiff {
    /// Properties set, with their new value
    pub changed: BTreeMap<KeyId, PropertyValue>,
    /// Properties removed
    pub removed: BTreeSet<KeyId>,
}

impl PropertyDiff {
    fn set(&mut self, key: KeyId, value: PropertyValue) {
        self.removed.remove(&key);
        self.changed.insert(key, value);
    }

    fn remove(&mut self, key: KeyId) {
        self.changed.remove(&key);
        self.removed.insert(key);
    }

    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Value after the diff: Some(Some) when set, Some(None) when removed,
    /// None when the diff does not touch the key
    pub fn lookup(&self, key: KeyId) -> Option<Option<&PropertyValue>> {
        if let Some(value) = self.changed.get(&key) {
            Some(Some(value))
        } else if self.removed.contains(&key) {
            Some(None)
        } else {
            None
        }
    }
}

/// A token created by the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedToken {
    /// Token kind
    pub kind: TokenKind,
    /// Reserved id
    pub id: u32,
    /// Name
    pub name: String,
}

/// The logical changes of one transaction
#[derive(Debug, Default)]
pub struct TransactionState {
    created_tokens: Vec<CreatedToken>,
    created_nodes: BTreeSet<u64>,
    deleted_nodes: BTreeSet<u64>,
    created_relationships: BTreeMap<u64, RelationshipData>,
    deleted_relationships: BTreeMap<u64, RelationshipData>,
    node_labels: BTreeMap<u64, LabelDiff>,
    node_properties: BTreeMap<u64, PropertyDiff>,
    relationship_properties: BTreeMap<u64, PropertyDiff>,
    added_rules: BTreeMap<u64, SchemaRule>,
    dropped_rules: BTreeMap<u64, SchemaRule>,
    explicit_index: Vec<ExplicitIndexCommand>,
}

impl TransactionState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new token
    pub fn token_do_create(&mut self, kind: TokenKind, id: u32, name: impl Into<String>) {
        self.created_tokens.push(CreatedToken {
            kind,
            id,
            name: name.into(),
        });
    }

    /// Record a node creation
    pub fn node_do_create(&mut self, id: u64) {
        self.created_nodes.insert(id);
    }

    /// Record a node deletion. A node created in this transaction just disappears.
    pub fn node_do_delete(&mut self, id: u64) {
        if !self.created_nodes.remove(&id) {
            self.deleted_nodes.insert(id);
        }
        self.node_labels.remove(&id);
        self.node_properties.remove(&id);
    }

    /// Record a relationship creation
    pub fn relationship_do_create(&mut self, id: u64, start_node: u64, type_id: TypeId, end_node: u64) {
        self.created_relationships
            .insert(id, RelationshipData::new(start_node, type_id, end_node));
    }

    /// Record a relationship deletion
    pub fn relationship_do_delete(&mut self, id: u64, data: RelationshipData) {
        if self.created_relationships.remove(&id).is_none() {
            self.deleted_relationships.insert(id, data);
        }
        self.relationship_properties.remove(&id);
    }

    /// Record a label being added to a node
    pub fn node_do_add_label(&mut self, node: u64, label: LabelId) {
        let diff = self.node_labels.entry(node).or_default();
        if !diff.removed.remove(&label) {
            diff.added.insert(label);
        }
    }

    /// Record a label being removed from a node
    pub fn node_do_remove_label(&mut self, node: u64, label: LabelId) {
        let diff = self.node_labels.entry(node).or_default();
        if !diff.added.remove(&label) {
            diff.removed.insert(label);
        }
    }

    /// Record a node property write
    pub fn node_do_set_property(&mut self, node: u64, key: KeyId, value: PropertyValue) {
        self.node_properties.entry(node).or_default().set(key, value);
    }

    /// Record a node property removal
    pub fn node_do_remove_property(&mut self, node: u64, key: KeyId) {
        self.node_properties.entry(node).or_default().remove(key);
    }

    /// Record a relationship property write
    pub fn relationship_do_set_property(&mut self, relationship: u64, key: KeyId, value: PropertyValue) {
        self.relationship_properties
            .entry(relationship)
            .or_default()
            .set(key, value);
    }

    /// Record a relationship property removal
    pub fn relationship_do_remove_property(&mut self, relationship: u64, key: KeyId) {
        self.relationship_properties
            .entry(relationship)
            .or_default()
            .remove(key);
    }

    /// Record a new schema rule
    pub fn schema_rule_do_add(&mut self, rule: SchemaRule) {
        self.added_rules.insert(rule.id, rule);
    }

    /// Record a dropped schema rule. Dropping a rule added in this transaction cancels it.
    pub fn schema_rule_do_drop(&mut self, rule: SchemaRule) {
        if self.added_rules.remove(&rule.id).is_none() {
            self.dropped_rules.insert(rule.id, rule);
        }
    }

    /// Record an explicit index operation
    pub fn explicit_index_do(&mut self, command: ExplicitIndexCommand) {
        self.explicit_index.push(command);
    }

    /// Tokens created so far
    pub fn created_tokens(&self) -> &[CreatedToken] {
        &self.created_tokens
    }

    /// Whether the node was created in this transaction
    pub fn is_node_created(&self, id: u64) -> bool {
        self.created_nodes.contains(&id)
    }

    /// Whether the node was deleted in this transaction
    pub fn is_node_deleted(&self, id: u64) -> bool {
        self.deleted_nodes.contains(&id)
    }

    /// Whether the relationship was created in this transaction
    pub fn is_relationship_created(&self, id: u64) -> bool {
        self.created_relationships.contains_key(&id)
    }

    /// Whether the relationship was deleted in this transaction
    pub fn is_relationship_deleted(&self, id: u64) -> bool {
        self.deleted_relationships.contains_key(&id)
    }

    /// Data of a relationship created in this transaction
    pub fn created_relationship(&self, id: u64) -> Option<RelationshipData> {
        self.created_relationships.get(&id).copied()
    }

    /// Relationships created in this transaction
    pub fn created_relationships(&self) -> impl Iterator<Item = (u64, RelationshipData)> + '_ {
        self.created_relationships.iter().map(|(id, data)| (*id, *data))
    }

    /// Relationships deleted in this transaction
    pub fn deleted_relationships(&self) -> impl Iterator<Item = (u64, RelationshipData)> + '_ {
        self.deleted_relationships.iter().map(|(id, data)| (*id, *data))
    }

    /// Nodes created in this transaction
    pub fn created_nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.created_nodes.iter().copied()
    }

    /// Nodes deleted in this transaction
    pub fn deleted_nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.deleted_nodes.iter().copied()
    }

    /// Label changes of a node
    pub fn label_diff(&self, node: u64) -> Option<&LabelDiff> {
        self.node_labels.get(&node)
    }

    /// Property changes of a node
    pub fn node_property_diff(&self, node: u64) -> Option<&PropertyDiff> {
        self.node_properties.get(&node)
    }

    /// Property changes of a relationship
    pub fn relationship_property_diff(&self, relationship: u64) -> Option<&PropertyDiff> {
        self.relationship_properties.get(&relationship)
    }

    /// Schema rules added in this transaction
    pub fn added_schema_rules(&self) -> impl Iterator<Item = &SchemaRule> + '_ {
        self.added_rules.values()
    }

    /// Whether the rule was dropped in this transaction
    pub fn is_schema_rule_dropped(&self, id: u64) -> bool {
        self.dropped_rules.contains_key(&id)
    }

    /// Whether any node, relationship, label or property changed
    pub fn has_data_changes(&self) -> bool {
        !self.created_nodes.is_empty()
            || !self.deleted_nodes.is_empty()
            || !self.created_relationships.is_empty()
            || !self.deleted_relationships.is_empty()
            || self.node_labels.values().any(|d| !d.is_empty())
            || self.node_properties.values().any(|d| !d.is_empty())
            || self.relationship_properties.values().any(|d| !d.is_empty())
    }

    /// Whether any schema rule changed
    pub fn has_schema_changes(&self) -> bool {
        !self.added_rules.is_empty() || !self.dropped_rules.is_empty()
    }

    /// Whether the transaction changes anything at all
    pub fn has_changes(&self) -> bool {
        self.has_data_changes()
            || self.has_schema_changes()
            || !self.created_tokens.is_empty()
            || !self.explicit_index.is_empty()
    }

    /// Whether the node exists as seen by this transaction
    pub fn node_exists(&self, reader: &StorageReader, node: u64) -> Result<bool> {
        if self.created_nodes.contains(&node) {
            return Ok(true);
        }
        if self.deleted_nodes.contains(&node) {
            return Ok(false);
        }
        Ok(reader.node(node)?.is_some())
    }

    /// Whether the relationship exists as seen by this transaction
    pub fn relationship_exists(&self, reader: &StorageReader, relationship: u64) -> Result<bool> {
        if self.created_relationships.contains_key(&relationship) {
            return Ok(true);
        }
        if self.deleted_relationships.contains_key(&relationship) {
            return Ok(false);
        }
        Ok(reader.relationship(relationship)?.is_some())
    }

    /// Labels of a node as seen by this transaction
    pub fn node_labels_after(&self, reader: &StorageReader, node: u64) -> Result<BTreeSet<LabelId>> {
        if self.deleted_nodes.contains(&node) {
            return Ok(BTreeSet::new());
        }
        let mut labels: BTreeSet<LabelId> = if self.created_nodes.contains(&node) {
            BTreeSet::new()
        } else {
            reader.node_labels(node)?.into_iter().collect()
        };
        if let Some(diff) = self.node_labels.get(&node) {
            diff.apply_to(&mut labels);
        }
        Ok(labels)
    }

    /// A node property as seen by this transaction
    pub fn node_property_after(
        &self,
        reader: &StorageReader,
        node: u64,
        key: KeyId,
    ) -> Result<Option<PropertyValue>> {
        if self.deleted_nodes.contains(&node) {
            return Ok(None);
        }
        if let Some(value) = self.node_properties.get(&node).and_then(|d| d.lookup(key)) {
            return Ok(value.cloned());
        }
        if self.created_nodes.contains(&node) {
            return Ok(None);
        }
        reader.node_property(node, key)
    }

    /// All properties of a node as seen by this transaction
    pub fn node_properties_after(
        &self,
        reader: &StorageReader,
        node: u64,
    ) -> Result<BTreeMap<KeyId, PropertyValue>> {
        if self.deleted_nodes.contains(&node) {
            return Ok(BTreeMap::new());
        }
        let mut properties = if self.created_nodes.contains(&node) {
            BTreeMap::new()
        } else {
            reader.node_properties(node)?
        };
        if let Some(diff) = self.node_properties.get(&node) {
            for key in &diff.removed {
                properties.remove(key);
            }
            for (key, value) in &diff.changed {
                properties.insert(*key, value.clone());
            }
        }
        Ok(properties)
    }

    /// A relationship property as seen by this transaction
    pub fn relationship_property_after(
        &self,
        reader: &StorageReader,
        relationship: u64,
        key: KeyId,
    ) -> Result<Option<PropertyValue>> {
        if self.deleted_relationships.contains_key(&relationship) {
            return Ok(None);
        }
        if let Some(value) = self
            .relationship_properties
            .get(&relationship)
            .and_then(|d| d.lookup(key))
        {
            return Ok(value.cloned());
        }
        if self.created_relationships.contains_key(&relationship) {
            return Ok(None);
        }
        reader.relationship_property(relationship, key)
    }

    /// Walk the state through a visitor.
    ///
    /// Order: tokens, created nodes, created relationships, deleted
    /// relationships, label changes, node properties, relationship
    /// properties, deleted nodes, dropped then added schema rules, explicit
    /// index operations, then `close`.
    pub fn accept(&self, visitor: &mut dyn TxStateVisitor) -> Result<()> {
        for token in &self.created_tokens {
            visitor.visit_created_token(token.kind, token.id, &token.name)?;
        }
        for node in &self.created_nodes {
            visitor.visit_created_node(*node)?;
        }
        for (id, data) in &self.created_relationships {
            visitor.visit_created_relationship(*id, *data)?;
        }
        for (id, data) in &self.deleted_relationships {
            visitor.visit_deleted_relationship(*id, *data)?;
        }
        for (node, diff) in self.node_labels.iter().filter(|(_, d)| !d.is_empty()) {
            visitor.visit_node_label_changes(*node, diff)?;
        }
        for (node, diff) in self.node_properties.iter().filter(|(_, d)| !d.is_empty()) {
            visitor.visit_node_property_changes(*node, diff)?;
        }
        for (relationship, diff) in self
            .relationship_properties
            .iter()
            .filter(|(_, d)| !d.is_empty())
        {
            visitor.visit_relationship_property_changes(*relationship, diff)?;
        }
        for node in &self.deleted_nodes {
            visitor.visit_deleted_node(*node)?;
        }
        for rule in self.dropped_rules.values() {
            visitor.visit_removed_schema_rule(rule)?;
        }
        for rule in self.added_rules.values() {
            visitor.visit_added_schema_rule(rule)?;
        }
        for command in &self.explicit_index {
            visitor.visit_explicit_index(command)?;
        }
        visitor.close()
    }
}
