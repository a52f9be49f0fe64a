//! Storage layer - record stores and the catalog
//!
//! Fixed-size record stores under the database directory:
//! - `nodes.store`: fixed-size node records (relationship chain head, property chain head, labels)
//! - `rels.store`: fixed-size relationship records, linked into one chain per endpoint
//! - `props.store`: one property per record, chained per owner
//! - `strings.store`: 32-byte blocks holding string values
//! - `catalog/`: LMDB environment with tokens, schema rules, counts,
//!   store metadata and explicit indexes
//!
//! The label scan store (`labelscan.store`) and the transaction log (`txlog`)
//! sit next to these but belong to the index and log modules.

pub mod catalog;
pub mod counts;
pub mod explicit_index;
pub mod id_generator;
mod mapped;
pub mod metadata;
pub mod property;
pub mod record;
pub mod record_store;
pub mod schema;
pub mod token;

pub use counts::{ANY, CountsKey, CountsStore};
pub use explicit_index::{ExplicitIndexCommand, ExplicitIndexStore, IndexEntityType};
pub use id_generator::{IdController, IdGenerator};
pub use metadata::MetaDataStore;
pub use property::PropertyValue;
pub use record::{
    DynamicRecord, NULL_REFERENCE, NodeRecord, PropertyRecord, Record, RelationshipRecord,
};
pub use record_store::RecordStore;
pub use schema::{SchemaCache, SchemaRule, SchemaRuleKind, SchemaStore};
pub use token::{KeyId, LabelId, TokenHolder, TokenHolders, TokenKind, TypeId};

use crate::config::EngineConfig;
use crate::{Error, Result};
use heed::Env;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// File name of the node store
pub const NODE_STORE: &str = "nodes.store";
/// File name of the relationship store
pub const RELATIONSHIP_STORE: &str = "rels.store";
/// File name of the property store
pub const PROPERTY_STORE: &str = "props.store";
/// File name of the string block store
pub const STRING_STORE: &str = "strings.store";
/// Directory of the catalog environment
pub const CATALOG_DIR: &str = "catalog";

/// Kind of store file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreType {
    /// nodes.store
    Node,
    /// rels.store
    Relationship,
    /// props.store
    Property,
    /// strings.store
    String,
    /// catalog environment
    Catalog,
    /// labelscan.store
    LabelScan,
}

/// One file backing the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFileMetadata {
    /// Path of the file or directory
    pub path: PathBuf,
    /// Store it belongs to
    pub store_type: StoreType,
    /// Record size for fixed-size record stores
    pub record_size: Option<usize>,
}

/// All record stores and catalog stores of one database
pub struct Stores {
    dir: PathBuf,
    nodes: RecordStore<NodeRecord>,
    relationships: RecordStore<RelationshipRecord>,
    properties: RecordStore<PropertyRecord>,
    strings: RecordStore<DynamicRecord>,
    env: Env,
    tokens: TokenHolders,
    schema: SchemaStore,
    counts: CountsStore,
    metadata: MetaDataStore,
    explicit_indexes: ExplicitIndexStore,
    closed: AtomicBool,
}

impl Stores {
    /// Open or create every store under `dir`
    pub fn open<P: AsRef<Path>>(dir: P, config: &EngineConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let size = config.initial_store_size;
        let reuse = config.reuse_ids;
        let nodes = RecordStore::open(dir.join(NODE_STORE), size, reuse)?;
        let relationships = RecordStore::open(dir.join(RELATIONSHIP_STORE), size, reuse)?;
        let properties = RecordStore::open(dir.join(PROPERTY_STORE), size, reuse)?;
        let strings = RecordStore::open(dir.join(STRING_STORE), size, reuse)?;

        let env = catalog::open_env(&dir.join(CATALOG_DIR), config.catalog_map_size)?;
        let tokens = TokenHolders::open(&env)?;
        let schema = SchemaStore::open(&env)?;
        let counts = CountsStore::open(&env)?;
        let metadata = MetaDataStore::open(&env)?;
        let explicit_indexes = ExplicitIndexStore::open(&env)?;

        tracing::info!(
            "Opened stores at {:?}: {} nodes, {} relationships (high ids)",
            dir,
            nodes.high_id(),
            relationships.high_id()
        );

        Ok(Self {
            dir,
            nodes,
            relationships,
            properties,
            strings,
            env,
            tokens,
            schema,
            counts,
            metadata,
            explicit_indexes,
            closed: AtomicBool::new(false),
        })
    }

    /// Database directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Node store
    pub fn nodes(&self) -> &RecordStore<NodeRecord> {
        &self.nodes
    }

    /// Relationship store
    pub fn relationships(&self) -> &RecordStore<RelationshipRecord> {
        &self.relationships
    }

    /// Property store
    pub fn properties(&self) -> &RecordStore<PropertyRecord> {
        &self.properties
    }

    /// String block store
    pub fn strings(&self) -> &RecordStore<DynamicRecord> {
        &self.strings
    }

    /// Token stores
    pub fn tokens(&self) -> &TokenHolders {
        &self.tokens
    }

    /// Schema rule store
    pub fn schema(&self) -> &SchemaStore {
        &self.schema
    }

    /// Counts store
    pub fn counts(&self) -> &CountsStore {
        &self.counts
    }

    /// Metadata store
    pub fn metadata(&self) -> &MetaDataStore {
        &self.metadata
    }

    /// Explicit index store
    pub fn explicit_indexes(&self) -> &ExplicitIndexStore {
        &self.explicit_indexes
    }

    /// Id generators of the record stores
    pub fn id_generators(&self) -> [&IdGenerator; 4] {
        [
            self.nodes.ids(),
            self.relationships.ids(),
            self.properties.ids(),
            self.strings.ids(),
        ]
    }

    /// Property records of the chain starting at `head`, in chain order
    pub fn property_chain(&self, head: u64) -> Result<Vec<(u64, PropertyRecord)>> {
        let limit = self.properties.high_id();
        let mut chain = Vec::new();
        let mut current = head;
        while current != NULL_REFERENCE {
            if chain.len() as u64 > limit {
                return Err(Error::storage(format!(
                    "cycle in property chain starting at {}",
                    head
                )));
            }
            let record = self.properties.read_in_use(current)?.ok_or_else(|| {
                Error::storage(format!("property record {} in chain is not in use", current))
            })?;
            chain.push((current, record));
            current = record.next_prop;
        }
        Ok(chain)
    }

    /// Decoded properties of the chain starting at `head`
    pub fn read_properties(&self, head: u64) -> Result<BTreeMap<KeyId, PropertyValue>> {
        let mut properties = BTreeMap::new();
        for (_, record) in self.property_chain(head)? {
            let value = property::read_value(&self.strings, record.value_type, record.value)?;
            properties.insert(record.key_id, value);
        }
        Ok(properties)
    }

    /// One decoded property of the chain starting at `head`
    pub fn read_property(&self, head: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        for (_, record) in self.property_chain(head)? {
            if record.key_id == key {
                return property::read_value(&self.strings, record.value_type, record.value).map(Some);
            }
        }
        Ok(None)
    }

    /// Property of an in-use node; None for unused nodes
    pub fn node_property(&self, node: u64, key: KeyId) -> Result<Option<PropertyValue>> {
        match self.nodes.read_in_use(node)? {
            Some(record) => self.read_property(record.next_prop, key),
            None => Ok(None),
        }
    }

    /// Fail if the stores have been closed
    pub fn assert_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreNotAvailable("stores are closed".to_string()));
        }
        Ok(())
    }

    /// Mark the stores as in use so an unclean exit is detected on next open
    pub fn make_store_ok(&self) -> Result<()> {
        self.assert_open()?;
        self.metadata.mark_in_use()
    }

    /// Flush record files and sync the catalog
    pub fn flush(&self) -> Result<()> {
        self.nodes.flush()?;
        self.relationships.flush()?;
        self.properties.flush()?;
        self.strings.flush()?;
        self.env.force_sync()?;
        Ok(())
    }

    /// Rebuild all id generators from store scans
    pub fn rebuild_id_generators(&self) -> Result<()> {
        self.nodes.rebuild_ids()?;
        self.relationships.rebuild_ids()?;
        self.properties.rebuild_ids()?;
        self.strings.rebuild_ids()?;
        Ok(())
    }

    /// Files backing these stores
    pub fn list_files(&self) -> Vec<StoreFileMetadata> {
        vec![
            StoreFileMetadata {
                path: self.nodes.path().to_path_buf(),
                store_type: StoreType::Node,
                record_size: Some(NodeRecord::SIZE),
            },
            StoreFileMetadata {
                path: self.relationships.path().to_path_buf(),
                store_type: StoreType::Relationship,
                record_size: Some(RelationshipRecord::SIZE),
            },
            StoreFileMetadata {
                path: self.properties.path().to_path_buf(),
                store_type: StoreType::Property,
                record_size: Some(PropertyRecord::SIZE),
            },
            StoreFileMetadata {
                path: self.strings.path().to_path_buf(),
                store_type: StoreType::String,
                record_size: Some(DynamicRecord::SIZE),
            },
            StoreFileMetadata {
                path: self.dir.join(CATALOG_DIR),
                store_type: StoreType::Catalog,
                record_size: None,
            },
        ]
    }

    /// Flush and mark clean; later calls are no-ops
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush()?;
        self.metadata.mark_clean()?;
        self.env.force_sync()?;
        tracing::info!("Closed stores at {:?}", self.dir);
        Ok(())
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> EngineConfig {
        EngineConfig {
            initial_store_size: 4096,
            catalog_map_size: 8 * 1024 * 1024,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_open_creates_files() {
        let dir = TempDir::new().unwrap();
        let stores = Stores::open(dir.path(), &test_config()).unwrap();
        for file in stores.list_files() {
            assert!(file.path.exists(), "{:?} missing", file.path);
        }
        assert_eq!(stores.list_files().len(), 5);
    }

    #[test]
    fn test_clean_shutdown_marker() {
        let dir = TempDir::new().unwrap();
        {
            let stores = Stores::open(dir.path(), &test_config()).unwrap();
            stores.make_store_ok().unwrap();
            stores.close().unwrap();
            stores.close().unwrap();
            assert!(stores.make_store_ok().is_err());
        }
        {
            let stores = Stores::open(dir.path(), &test_config()).unwrap();
            assert!(stores.metadata().was_clean_shutdown());
            stores.make_store_ok().unwrap();
            // dropped without close
        }
        let stores = Stores::open(dir.path(), &test_config()).unwrap();
        assert!(!stores.metadata().was_clean_shutdown());
    }

    #[test]
    fn test_rebuild_id_generators() {
        let dir = TempDir::new().unwrap();
        let stores = Stores::open(dir.path(), &test_config()).unwrap();
        stores.nodes().write(5, &NodeRecord::new_in_use()).unwrap();
        stores.nodes().ids().free_id(9);
        stores.rebuild_id_generators().unwrap();
        assert_eq!(stores.nodes().high_id(), 6);
        assert_eq!(stores.nodes().ids().buffered_count(), 0);
    }
}
