//! Kernel transactions
//!
//! A [`KernelTransaction`] collects changes in a [`TransactionState`] while
//! holding transaction locks through its own lock client. Nothing touches
//! the stores until [`KernelTransaction::commit`], which hands the state to
//! the database for command creation, logging and application.
//!
//! Reads through the transaction see its own writes.

use crate::database::GraphDatabase;
use crate::engine::{StorageReader, StoreRelationshipCursor};
use crate::lock::{
    Direction, LockClient, LockClientSession, NO_TRACER, RelationshipItem, RelationshipTraversal,
    ResourceLocker, ResourceType, TwoPhaseNodeForRelationshipLocking,
};
use crate::storage::explicit_index::{ExplicitIndexCommand, IndexEntityType};
use crate::storage::property::PropertyValue;
use crate::storage::schema::{SchemaRule, SchemaRuleKind};
use crate::storage::token::{KeyId, LabelId, TypeId};
use crate::txstate::{RelationshipData, TransactionState};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh3::xxh3_64;

/// The single lock guarding schema changes as a whole
const SCHEMA_LOCK_ID: u64 = 0;

/// Relationship cursor over the committed chain merged with the
/// transaction's own creations and deletions
pub struct TransactionRelationshipCursor<'t> {
    store: StoreRelationshipCursor<'t>,
    state: &'t TransactionState,
    use_store: bool,
    added: Vec<RelationshipItem>,
    position: usize,
}

impl<'t> TransactionRelationshipCursor<'t> {
    /// Cursor reading committed chains through `reader`
    pub fn new(reader: &'t StorageReader, state: &'t TransactionState) -> Self {
        Self {
            store: reader.relationship_cursor(),
            state,
            use_store: false,
            added: Vec::new(),
            position: 0,
        }
    }
}

impl RelationshipTraversal for TransactionRelationshipCursor<'_> {
    fn traverse(&mut self, node_id: u64) -> Result<()> {
        if self.state.is_node_deleted(node_id) {
            return Err(Error::not_found(format!("Node {} not found", node_id)));
        }
        self.use_store = !self.state.is_node_created(node_id);
        if self.use_store {
            self.store.traverse(node_id)?;
        }
        self.added = self
            .state
            .created_relationships()
            .filter(|(_, data)| data.touches(node_id))
            .map(|(id, data)| RelationshipItem {
                id,
                other_node: data.other_node(node_id),
                type_id: data.type_id,
                direction: data.direction_from(node_id),
            })
            .collect();
        self.position = 0;
        Ok(())
    }

    fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
        while self.use_store {
            match self.store.next_relationship()? {
                Some(item) if self.state.is_relationship_deleted(item.id) => continue,
                Some(item) => return Ok(Some(item)),
                None => self.use_store = false,
            }
        }
        let item = self.added.get(self.position).copied();
        self.position += 1;
        Ok(item)
    }
}

/// A write transaction against a [`GraphDatabase`]
pub struct KernelTransaction<'db> {
    db: &'db GraphDatabase,
    locks: LockClientSession,
    reader: StorageReader,
    state: TransactionState,
    last_tx_when_started: u64,
    reserved_nodes: Vec<u64>,
    reserved_relationships: Vec<u64>,
    created_explicit_indexes: BTreeMap<String, IndexEntityType>,
    open: bool,
}

impl<'db> KernelTransaction<'db> {
    pub(crate) fn new(db: &'db GraphDatabase, locks: LockClientSession, reader: StorageReader, last_tx_when_started: u64) -> Self {
        Self {
            db,
            locks,
            reader,
            state: TransactionState::new(),
            last_tx_when_started,
            reserved_nodes: Vec::new(),
            reserved_relationships: Vec::new(),
            created_explicit_indexes: BTreeMap::new(),
            open: true,
        }
    }

    /// Last committed transaction when this one began
    pub fn last_tx_when_started(&self) -> u64 {
        self.last_tx_when_started
    }

    /// The transaction's logical changes so far
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// The transaction's lock client
    pub fn lock_client(&self) -> &LockClientSession {
        &self.locks
    }

    fn assert_open(&self) -> Result<()> {
        if !self.open {
            return Err(Error::transaction("transaction is closed"));
        }
        Ok(())
    }

    fn assert_data_allowed(&self) -> Result<()> {
        self.assert_open()?;
        if self.state.has_schema_changes() {
            return Err(Error::transaction(
                "cannot mix data and schema changes in one transaction",
            ));
        }
        Ok(())
    }

    fn assert_schema_allowed(&self) -> Result<()> {
        self.assert_open()?;
        if self.state.has_data_changes() {
            return Err(Error::transaction(
                "cannot mix data and schema changes in one transaction",
            ));
        }
        Ok(())
    }

    fn lock_nodes(&self, nodes: &[u64]) -> Result<()> {
        let sorted: BTreeSet<u64> = nodes.iter().copied().collect();
        let sorted: Vec<u64> = sorted.into_iter().collect();
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Node, &sorted)
    }

    fn assert_node_exists(&self, node: u64) -> Result<()> {
        if !self.state.node_exists(&self.reader, node)? {
            return Err(Error::not_found(format!("Node {} not found", node)));
        }
        Ok(())
    }

    fn relationship_data(&self, relationship: u64) -> Result<RelationshipData> {
        if let Some(data) = self.state.created_relationship(relationship) {
            return Ok(data);
        }
        if self.state.is_relationship_deleted(relationship) {
            return Err(Error::not_found(format!("Relationship {} not found", relationship)));
        }
        let record = self
            .reader
            .relationship(relationship)?
            .ok_or_else(|| Error::not_found(format!("Relationship {} not found", relationship)))?;
        Ok(RelationshipData::new(
            record.first_node,
            record.type_id,
            record.second_node,
        ))
    }

    /// Create a node and return its id
    pub fn node_create(&mut self) -> Result<u64> {
        self.assert_data_allowed()?;
        let id = self.reader.command_creation_context().reserve_node();
        self.reserved_nodes.push(id);
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Node, &[id])?;
        self.state.node_do_create(id);
        Ok(id)
    }

    /// Delete a node. Fails at commit if it still has relationships.
    pub fn node_delete(&mut self, node: u64) -> Result<()> {
        self.assert_data_allowed()?;
        self.lock_nodes(&[node])?;
        self.assert_node_exists(node)?;
        self.state.node_do_delete(node);
        Ok(())
    }

    /// Delete a node together with all of its relationships.
    ///
    /// The node and every neighbour are locked first, so concurrent
    /// relationship creation can not slip in between. Returns the number of
    /// relationships deleted.
    pub fn node_detach_delete(&mut self, node: u64) -> Result<usize> {
        self.assert_data_allowed()?;
        let mut relationships = Vec::new();
        {
            let mut cursor = TransactionRelationshipCursor::new(&self.reader, &self.state);
            let mut locking = TwoPhaseNodeForRelationshipLocking::new(
                |id| {
                    relationships.push(id);
                    Ok(())
                },
                &self.locks,
                &NO_TRACER,
            );
            locking.lock_all_nodes_and_consume_relationships(node, &mut cursor)?;
        }
        for relationship in &relationships {
            self.locks
                .acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[*relationship])?;
            let data = self.relationship_data(*relationship)?;
            self.state.relationship_do_delete(*relationship, data);
        }
        self.state.node_do_delete(node);
        tracing::debug!("Detach-deleted node {} with {} relationships", node, relationships.len());
        Ok(relationships.len())
    }

    /// Create a relationship and return its id
    pub fn relationship_create(&mut self, start_node: u64, type_id: TypeId, end_node: u64) -> Result<u64> {
        self.assert_data_allowed()?;
        self.lock_nodes(&[start_node, end_node])?;
        self.assert_node_exists(start_node)?;
        self.assert_node_exists(end_node)?;
        let id = self.reader.command_creation_context().reserve_relationship();
        self.reserved_relationships.push(id);
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[id])?;
        self.state
            .relationship_do_create(id, start_node, type_id, end_node);
        Ok(id)
    }

    /// Delete a relationship
    pub fn relationship_delete(&mut self, relationship: u64) -> Result<()> {
        self.assert_data_allowed()?;
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[relationship])?;
        let data = self.relationship_data(relationship)?;
        self.lock_nodes(&[data.start_node, data.end_node])?;
        self.state.relationship_do_delete(relationship, data);
        Ok(())
    }

    /// Add a label to a node; returns false if it already had it
    pub fn node_add_label(&mut self, node: u64, label: LabelId) -> Result<bool> {
        self.assert_data_allowed()?;
        self.locks
            .acquire_shared(&NO_TRACER, ResourceType::Label, &[u64::from(label)])?;
        self.lock_nodes(&[node])?;
        self.assert_node_exists(node)?;
        if self.state.node_labels_after(&self.reader, node)?.contains(&label) {
            return Ok(false);
        }
        self.state.node_do_add_label(node, label);
        Ok(true)
    }

    /// Remove a label from a node; returns false if it did not have it
    pub fn node_remove_label(&mut self, node: u64, label: LabelId) -> Result<bool> {
        self.assert_data_allowed()?;
        self.locks
            .acquire_shared(&NO_TRACER, ResourceType::Label, &[u64::from(label)])?;
        self.lock_nodes(&[node])?;
        self.assert_node_exists(node)?;
        if !self.state.node_labels_after(&self.reader, node)?.contains(&label) {
            return Ok(false);
        }
        self.state.node_do_remove_label(node, label);
        Ok(true)
    }

    /// Set a node property, returning the previous value
    pub fn node_set_property(&mut self, node: u64, key: KeyId, value: PropertyValue) -> Result<Option<PropertyValue>> {
        self.assert_data_allowed()?;
        self.lock_nodes(&[node])?;
        self.assert_node_exists(node)?;
        let previous = self.state.node_property_after(&self.reader, node, key)?;
        if previous.as_ref() != Some(&value) {
            self.state.node_do_set_property(node, key, value);
        }
        Ok(previous)
    }

    /// Remove a node property, returning the previous value
    pub fn node_remove_property(&mut self, node: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        self.assert_data_allowed()?;
        self.lock_nodes(&[node])?;
        self.assert_node_exists(node)?;
        let previous = self.state.node_property_after(&self.reader, node, key)?;
        if previous.is_some() {
            self.state.node_do_remove_property(node, key);
        }
        Ok(previous)
    }

    /// Set a relationship property, returning the previous value
    pub fn relationship_set_property(
        &mut self,
        relationship: u64,
        key: KeyId,
        value: PropertyValue,
    ) -> Result<Option<PropertyValue>> {
        self.assert_data_allowed()?;
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[relationship])?;
        if !self.state.relationship_exists(&self.reader, relationship)? {
            return Err(Error::not_found(format!("Relationship {} not found", relationship)));
        }
        let previous = self
            .state
            .relationship_property_after(&self.reader, relationship, key)?;
        if previous.as_ref() != Some(&value) {
            self.state
                .relationship_do_set_property(relationship, key, value);
        }
        Ok(previous)
    }

    /// Remove a relationship property, returning the previous value
    pub fn relationship_remove_property(&mut self, relationship: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        self.assert_data_allowed()?;
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[relationship])?;
        if !self.state.relationship_exists(&self.reader, relationship)? {
            return Err(Error::not_found(format!("Relationship {} not found", relationship)));
        }
        let previous = self
            .state
            .relationship_property_after(&self.reader, relationship, key)?;
        if previous.is_some() {
            self.state
                .relationship_do_remove_property(relationship, key);
        }
        Ok(previous)
    }

    /// Whether the node exists as seen by this transaction
    pub fn node_exists(&self, node: u64) -> Result<bool> {
        self.state.node_exists(&self.reader, node)
    }

    /// Labels of a node as seen by this transaction
    pub fn node_labels(&self, node: u64) -> Result<Vec<LabelId>> {
        Ok(self
            .state
            .node_labels_after(&self.reader, node)?
            .into_iter()
            .collect())
    }

    /// A node property as seen by this transaction
    pub fn node_property(&self, node: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        self.state.node_property_after(&self.reader, node, key)
    }

    /// All properties of a node as seen by this transaction
    pub fn node_properties(&self, node: u64) -> Result<BTreeMap<KeyId, PropertyValue>> {
        self.state.node_properties_after(&self.reader, node)
    }

    /// A relationship property as seen by this transaction
    pub fn relationship_property(&self, relationship: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        self.state
            .relationship_property_after(&self.reader, relationship, key)
    }

    /// Relationships of a node as seen by this transaction
    pub fn node_relationships(&self, node: u64) -> Result<Vec<RelationshipItem>> {
        if !self.node_exists(node)? {
            return Ok(Vec::new());
        }
        let mut cursor = TransactionRelationshipCursor::new(&self.reader, &self.state);
        cursor.traverse(node)?;
        let mut items = Vec::new();
        while let Some(item) = cursor.next_relationship()? {
            items.push(item);
        }
        Ok(items)
    }

    /// Number of relationships of a node in `direction` (loops count in every direction)
    pub fn node_degree(&self, node: u64, direction: Direction) -> Result<usize> {
        Ok(self
            .node_relationships(node)?
            .iter()
            .filter(|item| item.direction == direction || item.direction == Direction::Loop)
            .count())
    }

    fn lock_schema(&self, label: LabelId) -> Result<()> {
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Schema, &[SCHEMA_LOCK_ID])?;
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::Label, &[u64::from(label)])
    }

    fn assert_no_equivalent(&self, rule: &SchemaRule) -> Result<()> {
        let cache = self.reader.schema_cache();
        let pending = self
            .state
            .added_schema_rules()
            .any(|added| added.same_definition(rule));
        let existing = cache
            .find_equivalent(rule)
            .filter(|existing| !self.state.is_schema_rule_dropped(existing.id));
        if pending || existing.is_some() {
            return Err(Error::constraint_violation(format!(
                "An equivalent schema rule already exists on label {} and key {}",
                rule.label_id(),
                rule.property_key_id()
            )));
        }
        Ok(())
    }

    /// Create a property index on (label, key); returns the rule id
    pub fn index_create(&mut self, label: LabelId, key: KeyId) -> Result<u64> {
        self.assert_schema_allowed()?;
        self.lock_schema(label)?;
        let context = self.reader.command_creation_context();
        let rule = SchemaRule {
            id: context.reserve_schema(),
            kind: SchemaRuleKind::Index {
                label_id: label,
                property_key_id: key,
                owning_constraint: None,
            },
        };
        self.assert_no_equivalent(&rule)?;
        let id = rule.id;
        self.state.schema_rule_do_add(rule);
        Ok(id)
    }

    /// Create a uniqueness constraint with its backing index; returns the constraint rule id
    pub fn constraint_create_unique(&mut self, label: LabelId, key: KeyId) -> Result<u64> {
        self.assert_schema_allowed()?;
        self.lock_schema(label)?;
        let context = self.reader.command_creation_context();
        let index_id = context.reserve_schema();
        let constraint_id = context.reserve_schema();
        let constraint = SchemaRule {
            id: constraint_id,
            kind: SchemaRuleKind::UniquenessConstraint {
                label_id: label,
                property_key_id: key,
                owned_index: index_id,
            },
        };
        self.assert_no_equivalent(&constraint)?;
        if let Some(index) = self.reader.schema_cache().index_for(label, key) {
            if !self.state.is_schema_rule_dropped(index.id) {
                return Err(Error::constraint_violation(format!(
                    "Index {} already covers label {} and key {}; drop it first",
                    index.id, label, key
                )));
            }
        }
        self.state.schema_rule_do_add(SchemaRule {
            id: index_id,
            kind: SchemaRuleKind::Index {
                label_id: label,
                property_key_id: key,
                owning_constraint: Some(constraint_id),
            },
        });
        self.state.schema_rule_do_add(constraint);
        Ok(constraint_id)
    }

    /// Create a property existence constraint; returns the rule id
    pub fn constraint_create_exists(&mut self, label: LabelId, key: KeyId) -> Result<u64> {
        self.assert_schema_allowed()?;
        self.lock_schema(label)?;
        let rule = SchemaRule {
            id: self.reader.command_creation_context().reserve_schema(),
            kind: SchemaRuleKind::ExistenceConstraint {
                label_id: label,
                property_key_id: key,
            },
        };
        self.assert_no_equivalent(&rule)?;
        let id = rule.id;
        self.state.schema_rule_do_add(rule);
        Ok(id)
    }

    /// Drop a schema rule. Dropping a uniqueness constraint drops its index too;
    /// an index owned by a constraint can only go with the constraint.
    pub fn schema_rule_drop(&mut self, id: u64) -> Result<()> {
        self.assert_schema_allowed()?;
        let cache = self.reader.schema_cache();
        let rule = cache
            .rule(id)
            .ok_or_else(|| Error::not_found(format!("Schema rule {} not found", id)))?;
        self.lock_schema(rule.label_id())?;
        match rule.kind {
            SchemaRuleKind::Index {
                owning_constraint: Some(owner),
                ..
            } => {
                return Err(Error::constraint_violation(format!(
                    "Index {} belongs to constraint {}; drop the constraint instead",
                    id, owner
                )));
            }
            SchemaRuleKind::UniquenessConstraint { owned_index, .. } => {
                if let Some(index) = cache.rule(owned_index) {
                    self.state.schema_rule_do_drop(index);
                }
            }
            _ => {}
        }
        self.state.schema_rule_do_drop(rule);
        Ok(())
    }

    fn lock_explicit_index(&self, name: &str) -> Result<()> {
        self.locks.acquire_exclusive(
            &NO_TRACER,
            ResourceType::ExplicitIndex,
            &[xxh3_64(name.as_bytes())],
        )
    }

    fn explicit_index_type(&self, name: &str) -> Result<Option<IndexEntityType>> {
        if let Some(entity) = self.created_explicit_indexes.get(name) {
            return Ok(Some(*entity));
        }
        self.db.engine().stores().explicit_indexes().definition(name)
    }

    /// Create a named node index
    pub fn explicit_index_create(&mut self, name: &str) -> Result<()> {
        self.assert_open()?;
        self.lock_explicit_index(name)?;
        if self.explicit_index_type(name)?.is_some() {
            return Err(Error::constraint_violation(format!(
                "explicit index '{}' already exists",
                name
            )));
        }
        self.created_explicit_indexes
            .insert(name.to_string(), IndexEntityType::Node);
        self.state.explicit_index_do(ExplicitIndexCommand::Create {
            name: name.to_string(),
            entity: IndexEntityType::Node,
        });
        Ok(())
    }

    fn assert_node_index(&self, name: &str) -> Result<()> {
        match self.explicit_index_type(name)? {
            Some(IndexEntityType::Node) => Ok(()),
            Some(IndexEntityType::Relationship) => Err(Error::invalid_state(format!(
                "explicit index '{}' holds relationships",
                name
            ))),
            None => Err(Error::not_found(format!("explicit index '{}'", name))),
        }
    }

    /// Add a node under (key, value) in a named index
    pub fn explicit_index_add_node(&mut self, name: &str, node: u64, key: &str, value: &str) -> Result<()> {
        self.assert_open()?;
        self.lock_explicit_index(name)?;
        self.assert_node_index(name)?;
        self.assert_node_exists(node)?;
        self.state.explicit_index_do(ExplicitIndexCommand::Add {
            name: name.to_string(),
            entity_id: node,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    /// Remove a node from (key, value) in a named index
    pub fn explicit_index_remove_node(&mut self, name: &str, node: u64, key: &str, value: &str) -> Result<()> {
        self.assert_open()?;
        self.lock_explicit_index(name)?;
        self.assert_node_index(name)?;
        self.state.explicit_index_do(ExplicitIndexCommand::Remove {
            name: name.to_string(),
            entity_id: node,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn release_ids(&mut self, keep_written: bool) {
        let context = self.reader.command_creation_context();
        for id in self.reserved_nodes.drain(..) {
            if !(keep_written && self.state.is_node_created(id)) {
                context.release_node(id);
            }
        }
        for id in self.reserved_relationships.drain(..) {
            if !(keep_written && self.state.is_relationship_created(id)) {
                context.release_relationship(id);
            }
        }
    }

    /// Commit; returns the transaction id, or None when nothing changed.
    ///
    /// On failure the transaction is rolled back and nothing reaches the stores.
    pub fn commit(mut self) -> Result<Option<u64>> {
        self.assert_open()?;
        self.open = false;
        let result = self.db.commit_state(
            &self.state,
            &self.reader,
            &self.locks,
            self.last_tx_when_started,
        );
        match &result {
            Ok(_) => self.release_ids(true),
            Err(e) => {
                tracing::debug!("Commit failed, rolling back: {}", e);
                self.release_ids(false);
            }
        }
        self.locks.release_all();
        result
    }

    /// Discard all changes and release locks
    pub fn rollback(mut self) {
        self.close_without_commit();
    }

    fn close_without_commit(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.release_ids(false);
        self.locks.release_all();
    }
}

impl Drop for KernelTransaction<'_> {
    fn drop(&mut self) {
        self.close_without_commit();
    }
}

impl std::fmt::Debug for KernelTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTransaction")
            .field("lock_client", &self.locks.id())
            .field("last_tx_when_started", &self.last_tx_when_started)
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_test_database;

    #[test]
    fn test_reads_see_own_writes() {
        let (db, _ctx) = setup_test_database().unwrap();
        let label = db.label("Person").unwrap();
        let name = db.property_key("name").unwrap();

        let mut tx = db.begin_tx().unwrap();
        let node = tx.node_create().unwrap();
        tx.node_add_label(node, label).unwrap();
        tx.node_set_property(node, name, PropertyValue::from("Ada")).unwrap();
        assert!(tx.node_exists(node).unwrap());
        assert_eq!(tx.node_labels(node).unwrap(), vec![label]);
        assert_eq!(tx.node_property(node, name).unwrap(), Some(PropertyValue::from("Ada")));
        assert!(db.new_reader().node(node).unwrap().is_none());
        tx.commit().unwrap();

        assert_eq!(db.new_reader().node_labels(node).unwrap(), vec![label]);
    }

    #[test]
    fn test_empty_commit_returns_none() {
        let (db, _ctx) = setup_test_database().unwrap();
        let tx = db.begin_tx().unwrap();
        assert_eq!(tx.commit().unwrap(), None);
        assert_eq!(db.last_committed_tx(), 0);
    }

    #[test]
    fn test_schema_and_data_do_not_mix() {
        let (db, _ctx) = setup_test_database().unwrap();
        let label = db.label("L").unwrap();
        let key = db.property_key("k").unwrap();

        let mut tx = db.begin_tx().unwrap();
        tx.node_create().unwrap();
        assert!(matches!(tx.index_create(label, key), Err(Error::Transaction(_))));

        let mut tx = db.begin_tx().unwrap();
        tx.index_create(label, key).unwrap();
        assert!(matches!(tx.node_create(), Err(Error::Transaction(_))));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (db, _ctx) = setup_test_database().unwrap();
        let mut tx = db.begin_tx().unwrap();
        let node = tx.node_create().unwrap();
        tx.rollback();
        assert!(db.new_reader().node(node).unwrap().is_none());
        assert_eq!(db.last_committed_tx(), 0);
    }

    #[test]
    fn test_tx_cursor_merges_created_and_deleted() {
        let (db, _ctx) = setup_test_database().unwrap();
        let knows = db.relationship_type("KNOWS").unwrap();

        let mut tx = db.begin_tx().unwrap();
        let a = tx.node_create().unwrap();
        let b = tx.node_create().unwrap();
        let r1 = tx.relationship_create(a, knows, b).unwrap();
        let r2 = tx.relationship_create(b, knows, a).unwrap();
        tx.commit().unwrap();

        let mut tx = db.begin_tx().unwrap();
        tx.relationship_delete(r1).unwrap();
        let r3 = tx.relationship_create(a, knows, a).unwrap();
        let items = tx.node_relationships(a).unwrap();
        let ids: Vec<u64> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![r2, r3]);
        assert_eq!(items[0].direction, Direction::Incoming);
        assert_eq!(items[1].direction, Direction::Loop);
        assert_eq!(tx.node_degree(a, Direction::Outgoing).unwrap(), 1);
    }

    #[test]
    fn test_explicit_index_requires_definition() {
        let (db, _ctx) = setup_test_database().unwrap();
        let mut tx = db.begin_tx().unwrap();
        let node = tx.node_create().unwrap();
        assert!(matches!(
            tx.explicit_index_add_node("people", node, "name", "ada"),
            Err(Error::EntityNotFound(_))
        ));
        tx.explicit_index_create("people").unwrap();
        tx.explicit_index_add_node("people", node, "name", "ada").unwrap();
        tx.commit().unwrap();

        let hits = db
            .engine()
            .stores()
            .explicit_indexes()
            .get("people", "name", "ada")
            .unwrap();
        assert_eq!(hits, vec![node]);
    }
}
