//! Record changes of one transaction
//!
//! Relationship chains are edited in place: a new relationship becomes the
//! head of both endpoint chains, a deleted one is unlinked from its
//! neighbours. Neighbouring relationship records are locked exclusively
//! before they are loaded, since another transaction may be editing the
//! chain of their other endpoint.

use crate::command::{
    Command, CommandMode, DynamicRecordChange, NodeCommand, PropertyCommand, PropertyOwner,
    RelationshipCommand, SchemaCommand, TokenCommand,
};
use crate::engine::StorageReader;
use crate::lock::{NO_TRACER, ResourceLocker, ResourceType};
use crate::record::RecordChanges;
use crate::storage::explicit_index::ExplicitIndexCommand;
use crate::storage::property::{self, PropertyValue, TYPE_STRING};
use crate::storage::record::{
    DynamicRecord, MAX_INLINE_LABELS, NULL_REFERENCE, NodeRecord, PropertyRecord, Record,
    RelationshipRecord,
};
use crate::storage::schema::SchemaRule;
use crate::storage::token::{KeyId, LabelId, TokenKind, TypeId};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Change to one property record and the string blocks of its value
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Property record id
    pub id: u64,
    /// Owning entity
    pub owner: PropertyOwner,
    /// Image when first loaded
    pub before: PropertyRecord,
    /// Image after this transaction
    pub after: PropertyRecord,
    /// Decoded value when first loaded
    pub before_value: Option<PropertyValue>,
    /// Decoded value after this transaction
    pub after_value: Option<PropertyValue>,
    /// String blocks written or freed
    pub value_records: Vec<DynamicRecordChange>,
}

impl PropertyChange {
    fn is_changed(&self) -> bool {
        self.before != self.after || !self.value_records.is_empty()
    }

    fn mode(&self) -> CommandMode {
        CommandMode::of(&self.before, &self.after)
    }

    fn to_command(&self) -> Command {
        Command::Property(PropertyCommand {
            id: self.id,
            owner: self.owner,
            before: self.before,
            after: self.after,
            before_value: self.before_value.clone(),
            after_value: self.after_value.clone(),
            value_records: self.value_records.clone(),
        })
    }
}

/// Record-level state of one transaction
pub struct TransactionRecordState<'s> {
    reader: &'s StorageReader,
    locks: &'s dyn ResourceLocker,
    nodes: RecordChanges<NodeRecord>,
    relationships: RecordChanges<RelationshipRecord>,
    properties: BTreeMap<u64, PropertyChange>,
    schema: BTreeMap<u64, SchemaCommand>,
    tokens: Vec<Command>,
    explicit_index: Vec<ExplicitIndexCommand>,
}

fn load_node(reader: &StorageReader, id: u64) -> Result<NodeRecord> {
    reader
        .stores()
        .nodes()
        .read_in_use(id)?
        .ok_or_else(|| Error::not_found(format!("Node {} not found", id)))
}

fn load_relationship(
    reader: &StorageReader,
    locks: &dyn ResourceLocker,
    id: u64,
) -> Result<RelationshipRecord> {
    locks.acquire_exclusive(&NO_TRACER, ResourceType::Relationship, &[id])?;
    reader
        .stores()
        .relationships()
        .read_in_use(id)?
        .ok_or_else(|| Error::not_found(format!("Relationship {} not found", id)))
}

impl<'s> TransactionRecordState<'s> {
    /// Empty record state reading committed records through `reader`
    pub fn new(reader: &'s StorageReader, locks: &'s dyn ResourceLocker) -> Self {
        Self {
            reader,
            locks,
            nodes: RecordChanges::new(),
            relationships: RecordChanges::new(),
            properties: BTreeMap::new(),
            schema: BTreeMap::new(),
            tokens: Vec::new(),
            explicit_index: Vec::new(),
        }
    }

    fn node_mut(&mut self, id: u64) -> Result<&mut NodeRecord> {
        let reader = self.reader;
        self.nodes.get_or_load(id, |id| load_node(reader, id))
    }

    fn relationship_mut(&mut self, id: u64) -> Result<&mut RelationshipRecord> {
        let reader = self.reader;
        let locks = self.locks;
        self.relationships
            .get_or_load(id, |id| load_relationship(reader, locks, id))
    }

    fn property_mut(&mut self, owner: PropertyOwner, id: u64) -> Result<&mut PropertyChange> {
        if !self.properties.contains_key(&id) {
            let stores = self.reader.stores();
            let record = stores
                .properties()
                .read_in_use(id)?
                .ok_or_else(|| Error::storage(format!("property record {} not in use", id)))?;
            let value = property::read_value(stores.strings(), record.value_type, record.value)?;
            self.properties.insert(
                id,
                PropertyChange {
                    id,
                    owner,
                    before: record,
                    after: record,
                    before_value: Some(value.clone()),
                    after_value: Some(value),
                    value_records: Vec::new(),
                },
            );
        }
        self.properties
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("property record {} vanished", id)))
    }

    fn owner_head(&mut self, owner: PropertyOwner) -> Result<u64> {
        Ok(match owner {
            PropertyOwner::Node(id) => self.node_mut(id)?.next_prop,
            PropertyOwner::Relationship(id) => self.relationship_mut(id)?.next_prop,
        })
    }

    fn set_owner_head(&mut self, owner: PropertyOwner, head: u64) -> Result<()> {
        match owner {
            PropertyOwner::Node(id) => self.node_mut(id)?.next_prop = head,
            PropertyOwner::Relationship(id) => self.relationship_mut(id)?.next_prop = head,
        }
        Ok(())
    }

    fn find_property(&mut self, owner: PropertyOwner, key: KeyId) -> Result<Option<u64>> {
        let mut current = self.owner_head(owner)?;
        let limit = self.reader.stores().properties().high_id();
        let mut steps = 0u64;
        while current != NULL_REFERENCE {
            steps += 1;
            if steps > limit.saturating_add(1) {
                return Err(Error::storage(format!("cycle in property chain of {:?}", owner)));
            }
            let change = self.property_mut(owner, current)?;
            if change.after.key_id == key {
                return Ok(Some(current));
            }
            current = change.after.next_prop;
        }
        Ok(None)
    }

    /// Release the string blocks of the property's current value
    fn free_value(&mut self, id: u64) -> Result<()> {
        let reader = self.reader;
        let strings = reader.stores().strings();
        let change = self
            .properties
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("property record {} not loaded", id)))?;
        if !change.after.in_use() || change.after.value_type != TYPE_STRING {
            return Ok(());
        }
        let stored = change.before.in_use()
            && change.before.value_type == TYPE_STRING
            && change.before.value == change.after.value;
        if stored {
            for block_id in property::string_block_ids(strings, change.after.value)? {
                change.value_records.push(DynamicRecordChange {
                    id: block_id,
                    before: strings.read(block_id)?,
                    after: DynamicRecord::default(),
                });
            }
        } else {
            change.value_records.retain(|r| r.before.in_use());
        }
        Ok(())
    }

    /// Encode a value, allocating string blocks if needed
    fn encode_value(&self, value: &PropertyValue) -> (u32, u64, Vec<DynamicRecordChange>) {
        if let Some(bits) = value.inline_bits() {
            return (value.type_tag(), bits, Vec::new());
        }
        let text = match value {
            PropertyValue::String(s) => s.as_str(),
            _ => "",
        };
        let context = self.reader.command_creation_context();
        let ids: Vec<u64> = (0..property::blocks_needed(text.len()))
            .map(|_| context.reserve_string_block())
            .collect();
        let first = ids.first().copied().unwrap_or(NULL_REFERENCE);
        let blocks = property::encode_string_blocks(text, &ids)
            .into_iter()
            .map(|(id, block)| DynamicRecordChange {
                id,
                before: DynamicRecord::default(),
                after: block,
            })
            .collect();
        (TYPE_STRING, first, blocks)
    }

    /// Create a node record
    pub fn node_create(&mut self, id: u64) {
        self.nodes.create(id, NodeRecord::new_in_use());
    }

    /// Delete a node record and its property chain; its relationship chain must be empty
    pub fn node_delete(&mut self, id: u64) -> Result<()> {
        let node = *self.node_mut(id)?;
        if node.next_rel != NULL_REFERENCE {
            return Err(Error::constraint_violation(format!(
                "Cannot delete node<{}>, because it still has relationships. \
                 To delete this node, you must first delete its relationships.",
                id
            )));
        }
        self.delete_property_chain(PropertyOwner::Node(id), node.next_prop)?;
        *self.node_mut(id)? = NodeRecord::default();
        Ok(())
    }

    /// Add a label to a node record
    pub fn add_label(&mut self, node: u64, label: LabelId) -> Result<()> {
        if label >= MAX_INLINE_LABELS {
            return Err(Error::invalid_state(format!(
                "label id {} does not fit in a node record",
                label
            )));
        }
        self.node_mut(node)?.add_label(label);
        Ok(())
    }

    /// Remove a label from a node record
    pub fn remove_label(&mut self, node: u64, label: LabelId) -> Result<()> {
        self.node_mut(node)?.remove_label(label);
        Ok(())
    }

    /// Create a relationship and link it at the head of both endpoint chains
    pub fn relationship_create(&mut self, id: u64, type_id: TypeId, start: u64, end: u64) -> Result<()> {
        let mut record = RelationshipRecord::new_in_use(start, end, type_id);
        let endpoints: &[u64] = if start == end { &[start] } else { &[start, end] };
        for &node in endpoints {
            let head = self.node_mut(node)?.next_rel;
            if head != NULL_REFERENCE {
                self.relationship_mut(head)?.set_prev_for(node, id);
            }
            record.set_prev_for(node, NULL_REFERENCE);
            record.set_next_for(node, head);
            self.node_mut(node)?.next_rel = id;
        }
        self.relationships.create(id, record);
        Ok(())
    }

    /// Unlink a relationship from both endpoint chains and delete it with its properties
    pub fn relationship_delete(&mut self, id: u64) -> Result<()> {
        let record = *self.relationship_mut(id)?;
        let (start, end) = (record.first_node, record.second_node);
        let endpoints: &[u64] = if start == end { &[start] } else { &[start, end] };
        for &node in endpoints {
            let prev = record.prev_for(node);
            let next = record.next_for(node);
            if prev == NULL_REFERENCE {
                self.node_mut(node)?.next_rel = next;
            } else {
                self.relationship_mut(prev)?.set_next_for(node, next);
            }
            if next != NULL_REFERENCE {
                self.relationship_mut(next)?.set_prev_for(node, prev);
            }
        }
        self.delete_property_chain(PropertyOwner::Relationship(id), record.next_prop)?;
        *self.relationship_mut(id)? = RelationshipRecord::default();
        Ok(())
    }

    fn delete_property_chain(&mut self, owner: PropertyOwner, head: u64) -> Result<()> {
        let mut current = head;
        while current != NULL_REFERENCE {
            let next = self.property_mut(owner, current)?.after.next_prop;
            self.free_value(current)?;
            let change = self.property_mut(owner, current)?;
            change.after = PropertyRecord::default();
            change.after_value = None;
            current = next;
        }
        Ok(())
    }

    fn set_property(&mut self, owner: PropertyOwner, key: KeyId, value: PropertyValue) -> Result<()> {
        let (value_type, bits, blocks) = self.encode_value(&value);
        match self.find_property(owner, key)? {
            Some(id) => {
                self.free_value(id)?;
                let change = self.property_mut(owner, id)?;
                change.after.value_type = value_type;
                change.after.value = bits;
                change.after_value = Some(value);
                change.value_records.extend(blocks);
            }
            None => {
                let id = self.reader.command_creation_context().reserve_property();
                let head = self.owner_head(owner)?;
                let mut record = PropertyRecord::new_in_use(key, value_type, bits);
                record.next_prop = head;
                record.prev_prop = NULL_REFERENCE;
                if head != NULL_REFERENCE {
                    self.property_mut(owner, head)?.after.prev_prop = id;
                }
                self.set_owner_head(owner, id)?;
                self.properties.insert(
                    id,
                    PropertyChange {
                        id,
                        owner,
                        before: PropertyRecord::default(),
                        after: record,
                        before_value: None,
                        after_value: Some(value),
                        value_records: blocks,
                    },
                );
            }
        }
        Ok(())
    }

    fn remove_property(&mut self, owner: PropertyOwner, key: KeyId) -> Result<()> {
        let Some(id) = self.find_property(owner, key)? else {
            return Ok(());
        };
        self.free_value(id)?;
        let change = self.property_mut(owner, id)?;
        let (prev, next) = (change.after.prev_prop, change.after.next_prop);
        change.after = PropertyRecord::default();
        change.after_value = None;

        if prev == NULL_REFERENCE {
            self.set_owner_head(owner, next)?;
        } else {
            self.property_mut(owner, prev)?.after.next_prop = next;
        }
        if next != NULL_REFERENCE {
            self.property_mut(owner, next)?.after.prev_prop = prev;
        }
        Ok(())
    }

    /// Set a node property
    pub fn node_set_property(&mut self, node: u64, key: KeyId, value: PropertyValue) -> Result<()> {
        self.set_property(PropertyOwner::Node(node), key, value)
    }

    /// Remove a node property; absent keys are ignored
    pub fn node_remove_property(&mut self, node: u64, key: KeyId) -> Result<()> {
        self.remove_property(PropertyOwner::Node(node), key)
    }

    /// Set a relationship property
    pub fn relationship_set_property(&mut self, relationship: u64, key: KeyId, value: PropertyValue) -> Result<()> {
        self.set_property(PropertyOwner::Relationship(relationship), key, value)
    }

    /// Remove a relationship property; absent keys are ignored
    pub fn relationship_remove_property(&mut self, relationship: u64, key: KeyId) -> Result<()> {
        self.remove_property(PropertyOwner::Relationship(relationship), key)
    }

    /// Add a schema rule
    pub fn create_schema_rule(&mut self, rule: SchemaRule) {
        self.schema.insert(
            rule.id,
            SchemaCommand {
                id: rule.id,
                before: None,
                after: Some(rule),
            },
        );
    }

    /// Drop a schema rule
    pub fn drop_schema_rule(&mut self, rule: SchemaRule) {
        self.schema.insert(
            rule.id,
            SchemaCommand {
                id: rule.id,
                before: Some(rule),
                after: None,
            },
        );
    }

    /// Create a label token
    pub fn create_label_token(&mut self, id: u32, name: &str) {
        self.create_token(TokenKind::Label, id, name);
    }

    /// Create a relationship type token
    pub fn create_relationship_type_token(&mut self, id: u32, name: &str) {
        self.create_token(TokenKind::RelationshipType, id, name);
    }

    /// Create a property key token
    pub fn create_property_key_token(&mut self, id: u32, name: &str) {
        self.create_token(TokenKind::PropertyKey, id, name);
    }

    /// Create a token of any kind
    pub fn create_token(&mut self, kind: TokenKind, id: u32, name: &str) {
        let token = TokenCommand {
            id,
            name: name.to_string(),
        };
        self.tokens.push(match kind {
            TokenKind::Label => Command::LabelToken(token),
            TokenKind::RelationshipType => Command::RelationshipTypeToken(token),
            TokenKind::PropertyKey => Command::PropertyKeyToken(token),
        });
    }

    /// Queue an explicit index operation
    pub fn explicit_index(&mut self, command: ExplicitIndexCommand) {
        self.explicit_index.push(command);
    }

    /// Whether no command would be extracted
    pub fn is_empty(&self) -> bool {
        let mut commands = Vec::new();
        self.extract_commands(&mut commands);
        commands.is_empty()
    }

    /// Append the commands of this transaction.
    ///
    /// Tokens first, then record commands grouped by mode (creations,
    /// updates, deletions), each group ordered properties, relationships,
    /// nodes and ascending ids, then schema commands, then explicit index
    /// commands. Untouched records are skipped.
    pub fn extract_commands(&self, commands: &mut Vec<Command>) {
        commands.extend(self.tokens.iter().cloned());
        for mode in [CommandMode::Create, CommandMode::Update, CommandMode::Delete] {
            for change in self
                .properties
                .values()
                .filter(|p| p.is_changed() && p.mode() == mode)
            {
                commands.push(change.to_command());
            }
            for change in self.relationships.changed(mode) {
                commands.push(Command::Relationship(RelationshipCommand {
                    id: change.id,
                    before: change.before,
                    after: change.after,
                }));
            }
            for change in self.nodes.changed(mode) {
                commands.push(Command::Node(NodeCommand {
                    id: change.id,
                    before: change.before,
                    after: change.after,
                }));
            }
        }
        commands.extend(self.schema.values().cloned().map(Command::Schema));
        commands.extend(
            self.explicit_index
                .iter()
                .cloned()
                .map(Command::ExplicitIndex),
        );
    }
}
