//! Constraint enforcement at commit
//!
//! Uniqueness is checked as property values and labels are visited. The
//! visitor first takes an exclusive lock on the hashed (label, key, value)
//! entry so that two transactions claiming the same value serialise, then
//! looks for another holder among committed nodes and among this
//! transaction's own writes. Existence constraints are checked in `close`,
//! once every change of the transaction is known.

use crate::engine::StorageReader;
use crate::lock::{NO_TRACER, ResourceLocker, ResourceType};
use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::property::PropertyValue;
use crate::storage::schema::{SchemaRule, SchemaRuleKind};
use crate::storage::token::{KeyId, LabelId, TokenKind};
use crate::txstate::{LabelDiff, PropertyDiff, RelationshipData, TransactionState, TxStateVisitor};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh3::xxh3_64;

/// Lock id of an index entry
pub fn index_entry_hash(label: LabelId, key: KeyId, value: &PropertyValue) -> u64 {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&label.to_le_bytes());
    bytes.extend_from_slice(&key.to_le_bytes());
    bytes.extend_from_slice(&value.to_key_bytes());
    xxh3_64(&bytes)
}

/// Checks uniqueness and existence constraints, then forwards to the wrapped visitor
pub struct ConstraintEnforcingVisitor<'a> {
    inner: Box<dyn TxStateVisitor + 'a>,
    state: &'a TransactionState,
    reader: &'a StorageReader,
    locks: &'a dyn ResourceLocker,
    touched: BTreeSet<u64>,
    claimed: BTreeMap<(LabelId, KeyId, PropertyValue), u64>,
}

impl<'a> ConstraintEnforcingVisitor<'a> {
    /// Wrap `inner`
    pub fn new(
        inner: Box<dyn TxStateVisitor + 'a>,
        state: &'a TransactionState,
        reader: &'a StorageReader,
        locks: &'a dyn ResourceLocker,
    ) -> Self {
        Self {
            inner,
            state,
            reader,
            locks,
            touched: BTreeSet::new(),
            claimed: BTreeMap::new(),
        }
    }

    fn check_unique(&mut self, node: u64, label: LabelId, key: KeyId, value: &PropertyValue) -> Result<()> {
        let hash = index_entry_hash(label, key, value);
        self.locks
            .acquire_exclusive(&NO_TRACER, ResourceType::IndexEntry, &[hash])?;

        let claim = (label, key, value.clone());
        if let Some(other) = self.claimed.get(&claim) {
            if *other != node {
                return Err(self.uniqueness_violation(*other, label, key, value));
            }
        }
        self.claimed.insert(claim, node);

        let candidates = match self.reader.index_seek(label, key, value) {
            Some(nodes) => nodes,
            None => self.reader.nodes_with_label(label),
        };
        for other in candidates.into_iter().filter(|other| *other != node) {
            if self.still_holds(other, label, key, value)? {
                return Err(self.uniqueness_violation(other, label, key, value));
            }
        }
        Ok(())
    }

    fn still_holds(&self, node: u64, label: LabelId, key: KeyId, value: &PropertyValue) -> Result<bool> {
        if self.state.is_node_deleted(node) {
            return Ok(false);
        }
        if !self.state.node_labels_after(self.reader, node)?.contains(&label) {
            return Ok(false);
        }
        Ok(self.state.node_property_after(self.reader, node, key)?.as_ref() == Some(value))
    }

    fn uniqueness_violation(&self, other: u64, label: LabelId, key: KeyId, value: &PropertyValue) -> Error {
        Error::constraint_violation(format!(
            "Node({}) already exists with label `{}` and property `{}` = {}",
            other,
            self.reader.token_name(TokenKind::Label, label),
            self.reader.token_name(TokenKind::PropertyKey, key),
            value
        ))
    }

    fn validate_existing_unique(&self, label: LabelId, key: KeyId) -> Result<()> {
        let mut seen: BTreeMap<PropertyValue, u64> = BTreeMap::new();
        for node in self.reader.nodes_with_label(label) {
            if let Some(value) = self.reader.node_property(node, key)? {
                if let Some(first) = seen.get(&value) {
                    return Err(Error::CreateConstraintFailure(format!(
                        "Unable to create uniqueness constraint on :{}({}): nodes {} and {} share the value {}",
                        self.reader.token_name(TokenKind::Label, label),
                        self.reader.token_name(TokenKind::PropertyKey, key),
                        first,
                        node,
                        value
                    )));
                }
                seen.insert(value, node);
            }
        }
        Ok(())
    }

    fn validate_existing_exists(&self, label: LabelId, key: KeyId) -> Result<()> {
        for node in self.reader.nodes_with_label(label) {
            if self.reader.node_property(node, key)?.is_none() {
                return Err(Error::CreateConstraintFailure(format!(
                    "Unable to create existence constraint on :{}({}): node {} has no such property",
                    self.reader.token_name(TokenKind::Label, label),
                    self.reader.token_name(TokenKind::PropertyKey, key),
                    node
                )));
            }
        }
        Ok(())
    }

    fn check_existence(&self, node: u64) -> Result<()> {
        let schema = self.reader.schema_cache();
        for label in self.state.node_labels_after(self.reader, node)? {
            for key in schema.required_keys_for_label(label) {
                if self.state.node_property_after(self.reader, node, key)?.is_none() {
                    return Err(Error::constraint_violation(format!(
                        "Node({}) with label `{}` must have the property `{}`",
                        node,
                        self.reader.token_name(TokenKind::Label, label),
                        self.reader.token_name(TokenKind::PropertyKey, key)
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TxStateVisitor for ConstraintEnforcingVisitor<'_> {
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        self.inner.visit_created_token(kind, id, name)
    }

    fn visit_created_node(&mut self, id: u64) -> Result<()> {
        self.touched.insert(id);
        self.inner.visit_created_node(id)
    }

    fn visit_deleted_node(&mut self, id: u64) -> Result<()> {
        self.touched.remove(&id);
        self.inner.visit_deleted_node(id)
    }

    fn visit_created_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()> {
        self.inner.visit_created_relationship(id, data)
    }

    fn visit_deleted_relationship(&mut self, id: u64, data: RelationshipData) -> Result<()> {
        self.inner.visit_deleted_relationship(id, data)
    }

    fn visit_node_label_changes(&mut self, id: u64, diff: &LabelDiff) -> Result<()> {
        self.touched.insert(id);
        for label in &diff.added {
            for key in self.reader.schema_cache().unique_keys_for_label(*label) {
                if let Some(value) = self.state.node_property_after(self.reader, id, key)? {
                    self.check_unique(id, *label, key, &value)?;
                }
            }
        }
        self.inner.visit_node_label_changes(id, diff)
    }

    fn visit_node_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        self.touched.insert(id);
        let labels = self.state.node_labels_after(self.reader, id)?;
        for (key, value) in &diff.changed {
            for label in &labels {
                if self
                    .reader
                    .schema_cache()
                    .uniqueness_constraint(*label, *key)
                    .is_some()
                {
                    self.check_unique(id, *label, *key, value)?;
                }
            }
        }
        self.inner.visit_node_property_changes(id, diff)
    }

    fn visit_relationship_property_changes(&mut self, id: u64, diff: &PropertyDiff) -> Result<()> {
        self.inner.visit_relationship_property_changes(id, diff)
    }

    fn visit_added_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        match rule.kind {
            SchemaRuleKind::UniquenessConstraint {
                label_id,
                property_key_id,
                ..
            } => self.validate_existing_unique(label_id, property_key_id)?,
            SchemaRuleKind::ExistenceConstraint {
                label_id,
                property_key_id,
            } => self.validate_existing_exists(label_id, property_key_id)?,
            SchemaRuleKind::Index { .. } => {}
        }
        self.inner.visit_added_schema_rule(rule)
    }

    fn visit_removed_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.inner.visit_removed_schema_rule(rule)
    }

    fn visit_explicit_index(&mut self, command: &ExplicitIndexCommand) -> Result<()> {
        self.inner.visit_explicit_index(command)
    }

    fn close(&mut self) -> Result<()> {
        for node in &self.touched {
            if !self.state.is_node_deleted(*node) {
                self.check_existence(*node)?;
            }
        }
        self.inner.close()
    }
}
