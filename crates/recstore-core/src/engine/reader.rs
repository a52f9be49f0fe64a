//! Read-committed view over the engine's stores

use crate::index::{IndexingService, LabelScanStore};
use crate::lock::{Direction, RelationshipItem, RelationshipTraversal};
use crate::storage::counts::ANY;
use crate::storage::property::PropertyValue;
use crate::storage::record::{NULL_REFERENCE, NodeRecord, RelationshipRecord};
use crate::storage::schema::SchemaCache;
use crate::storage::token::{KeyId, LabelId, TokenKind, TypeId};
use crate::storage::Stores;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reserves record ids for commands being created.
///
/// Ids handed out here belong to the transaction; a rolled back
/// transaction gives them back with the `release_*` methods.
#[derive(Clone)]
pub struct CommandCreationContext {
    stores: Arc<Stores>,
}

impl CommandCreationContext {
    pub(crate) fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }

    /// Reserve a node id
    pub fn reserve_node(&self) -> u64 {
        self.stores.nodes().ids().next_id()
    }

    /// Reserve a relationship id
    pub fn reserve_relationship(&self) -> u64 {
        self.stores.relationships().ids().next_id()
    }

    /// Reserve a property record id
    pub fn reserve_property(&self) -> u64 {
        self.stores.properties().ids().next_id()
    }

    /// Reserve a string block id
    pub fn reserve_string_block(&self) -> u64 {
        self.stores.strings().ids().next_id()
    }

    /// Reserve a schema rule id
    pub fn reserve_schema(&self) -> u64 {
        self.stores.schema().reserve_id()
    }

    /// Give back a node id that was never written
    pub fn release_node(&self, id: u64) {
        self.stores.nodes().ids().release_unused(id);
    }

    /// Give back a relationship id that was never written
    pub fn release_relationship(&self, id: u64) {
        self.stores.relationships().ids().release_unused(id);
    }
}

/// Snapshot-free reader over committed data.
///
/// Reads go straight to the stores, so a reader sees every transaction
/// applied before the read, including ones applied after it was created.
#[derive(Clone)]
pub struct StorageReader {
    stores: Arc<Stores>,
    schema_cache: Arc<SchemaCache>,
    label_scan: Arc<LabelScanStore>,
    indexing: Arc<IndexingService>,
    context: CommandCreationContext,
}

impl StorageReader {
    pub(crate) fn new(
        stores: Arc<Stores>,
        schema_cache: Arc<SchemaCache>,
        label_scan: Arc<LabelScanStore>,
        indexing: Arc<IndexingService>,
    ) -> Self {
        let context = CommandCreationContext::new(Arc::clone(&stores));
        Self {
            stores,
            schema_cache,
            label_scan,
            indexing,
            context,
        }
    }

    /// Underlying stores
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Schema rules in effect
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    /// Id reservation for the transaction using this reader
    pub fn command_creation_context(&self) -> &CommandCreationContext {
        &self.context
    }

    /// Node record if in use
    pub fn node(&self, id: u64) -> Result<Option<NodeRecord>> {
        self.stores.nodes().read_in_use(id)
    }

    /// Labels of a node; empty if the node is not in use
    pub fn node_labels(&self, id: u64) -> Result<Vec<LabelId>> {
        Ok(self.node(id)?.map(|n| n.labels()).unwrap_or_default())
    }

    /// One property of a node
    pub fn node_property(&self, id: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        self.stores.node_property(id, key)
    }

    /// All properties of a node
    pub fn node_properties(&self, id: u64) -> Result<BTreeMap<KeyId, PropertyValue>> {
        match self.node(id)? {
            Some(node) => self.stores.read_properties(node.next_prop),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Relationship record if in use
    pub fn relationship(&self, id: u64) -> Result<Option<RelationshipRecord>> {
        self.stores.relationships().read_in_use(id)
    }

    /// One property of a relationship
    pub fn relationship_property(&self, id: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        match self.relationship(id)? {
            Some(rel) => self.stores.read_property(rel.next_prop, key),
            None => Ok(None),
        }
    }

    /// All properties of a relationship
    pub fn relationship_properties(&self, id: u64) -> Result<BTreeMap<KeyId, PropertyValue>> {
        match self.relationship(id)? {
            Some(rel) => self.stores.read_properties(rel.next_prop),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Cursor over stored relationship chains
    pub fn relationship_cursor(&self) -> StoreRelationshipCursor<'_> {
        StoreRelationshipCursor::new(&self.stores)
    }

    /// Relationships in a node's stored chain, in chain order
    pub fn node_relationships(&self, node: u64) -> Result<Vec<RelationshipItem>> {
        if self.node(node)?.is_none() {
            return Ok(Vec::new());
        }
        let mut cursor = self.relationship_cursor();
        cursor.traverse(node)?;
        let mut items = Vec::new();
        while let Some(item) = cursor.next_relationship()? {
            items.push(item);
        }
        Ok(items)
    }

    /// Nodes carrying `label`, from the label scan store
    pub fn nodes_with_label(&self, label: LabelId) -> Vec<u64> {
        self.label_scan.nodes_with_label(label)
    }

    /// Nodes with `label` and `key` = `value`, if an online index covers it
    pub fn index_seek(&self, label: LabelId, key: KeyId, value: &PropertyValue) -> Option<Vec<u64>> {
        self.indexing.seek(label, key, value)
    }

    /// Token name, or a placeholder naming the id
    pub fn token_name(&self, kind: TokenKind, id: u32) -> String {
        self.stores.tokens().holder(kind).display_name(id)
    }

    /// Token id by name
    pub fn token_id(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.stores.tokens().holder(kind).id_of(name)
    }

    /// Number of nodes with `label` (`ANY` for all)
    pub fn count_nodes(&self, label: LabelId) -> i64 {
        self.stores.counts().node_count(label)
    }

    /// Number of relationships matching the pattern (`ANY` as wildcard)
    pub fn count_relationships(&self, start_label: LabelId, type_id: TypeId, end_label: LabelId) -> i64 {
        self.stores
            .counts()
            .relationship_count(start_label, type_id, end_label)
    }

    /// Number of nodes in use
    pub fn node_count(&self) -> i64 {
        self.count_nodes(ANY)
    }
}

/// Follows a node's relationship chain through the relationship store
pub struct StoreRelationshipCursor<'a> {
    stores: &'a Stores,
    node: u64,
    next: u64,
    steps: u64,
}

impl<'a> StoreRelationshipCursor<'a> {
    /// Unpositioned cursor
    pub fn new(stores: &'a Stores) -> Self {
        Self {
            stores,
            node: NULL_REFERENCE,
            next: NULL_REFERENCE,
            steps: 0,
        }
    }
}

impl RelationshipTraversal for StoreRelationshipCursor<'_> {
    fn traverse(&mut self, node_id: u64) -> Result<()> {
        let node = self
            .stores
            .nodes()
            .read_in_use(node_id)?
            .ok_or_else(|| Error::not_found(format!("Node {} not found", node_id)))?;
        self.node = node_id;
        self.next = node.next_rel;
        self.steps = 0;
        Ok(())
    }

    fn next_relationship(&mut self) -> Result<Option<RelationshipItem>> {
        if self.next == NULL_REFERENCE {
            return Ok(None);
        }
        self.steps += 1;
        if self.steps > self.stores.relationships().high_id().saturating_add(1) {
            return Err(Error::storage(format!(
                "cycle in relationship chain of node {}",
                self.node
            )));
        }
        let id = self.next;
        let record = self
            .stores
            .relationships()
            .read_in_use(id)?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "Relationship {} in chain of node {} not found",
                    id, self.node
                ))
            })?;
        if !record.touches(self.node) {
            return Err(Error::storage(format!(
                "relationship {} in chain of node {} does not touch it",
                id, self.node
            )));
        }
        self.next = record.next_for(self.node);
        let direction = if record.is_loop() {
            Direction::Loop
        } else if record.first_node == self.node {
            Direction::Outgoing
        } else {
            Direction::Incoming
        };
        Ok(Some(RelationshipItem {
            id,
            other_node: record.other_node(self.node),
            type_id: record.type_id,
            direction,
        }))
    }
}
