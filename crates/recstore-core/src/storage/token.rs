//! Token stores: labels, relationship types and property keys
//!
//! Each token kind keeps a bidirectional name ↔ id mapping in the catalog
//! plus lock-free in-memory caches. The persisted mapping is written by the
//! command applier; the caches are filled at startup and on commit.

use crate::storage::record::MAX_INLINE_LABELS;
use crate::{Error, Result};
use dashmap::DashMap;
use heed::types::*;
use heed::{Database, Env, byteorder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Label ID type
pub type LabelId = u32;

/// Relationship type ID
pub type TypeId = u32;

/// Property key ID
pub type KeyId = u32;

/// Kind of token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// Node label
    Label,
    /// Relationship type
    RelationshipType,
    /// Property key
    PropertyKey,
}

impl TokenKind {
    fn db_names(&self) -> (&'static str, &'static str) {
        match self {
            TokenKind::Label => ("label_name_to_id", "label_id_to_name"),
            TokenKind::RelationshipType => ("type_name_to_id", "type_id_to_name"),
            TokenKind::PropertyKey => ("key_name_to_id", "key_id_to_name"),
        }
    }

    fn capacity(&self) -> u32 {
        match self {
            TokenKind::Label => MAX_INLINE_LABELS,
            _ => u32::MAX,
        }
    }
}

/// Persisted mapping and cache for one token kind
pub struct TokenHolder {
    kind: TokenKind,
    env: Env,
    name_to_id: Database<Str, U32<byteorder::NativeEndian>>,
    id_to_name: Database<U32<byteorder::NativeEndian>, Str>,
    name_cache: DashMap<String, u32>,
    id_cache: DashMap<u32, String>,
    next_id: AtomicU32,
}

impl TokenHolder {
    /// Open the token databases of `kind` in the catalog environment
    pub fn open(env: &Env, kind: TokenKind) -> Result<Self> {
        let (n2i, i2n) = kind.db_names();
        let mut wtxn = env.write_txn()?;
        let name_to_id = env.create_database(&mut wtxn, Some(n2i))?;
        let id_to_name = env.create_database(&mut wtxn, Some(i2n))?;
        wtxn.commit()?;

        let holder = Self {
            kind,
            env: env.clone(),
            name_to_id,
            id_to_name,
            name_cache: DashMap::new(),
            id_cache: DashMap::new(),
            next_id: AtomicU32::new(0),
        };
        holder.refresh_next_id()?;
        Ok(holder)
    }

    fn refresh_next_id(&self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        let next = self
            .id_to_name
            .iter(&rtxn)?
            .map(|r| r.map(|(id, _)| id))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .max()
            .map(|max_id| max_id + 1)
            .unwrap_or(0);
        self.next_id.fetch_max(next, Ordering::SeqCst);
        Ok(())
    }

    /// Token kind
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Load every persisted token into the caches
    pub fn init_cache(&self) -> Result<usize> {
        self.name_cache.clear();
        self.id_cache.clear();
        let rtxn = self.env.read_txn()?;
        let mut loaded = 0;
        for result in self.name_to_id.iter(&rtxn)? {
            let (name, id) = result?;
            self.name_cache.insert(name.to_string(), id);
            self.id_cache.insert(id, name.to_string());
            loaded += 1;
        }
        drop(rtxn);
        self.refresh_next_id()?;
        Ok(loaded)
    }

    /// Id of a token by name, from the cache
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.name_cache.get(name).map(|id| *id)
    }

    /// Name of a token by id, from the cache
    pub fn name_of(&self, id: u32) -> Option<String> {
        self.id_cache.get(&id).map(|name| name.clone())
    }

    /// Name of a token, or a placeholder naming its id
    pub fn display_name(&self, id: u32) -> String {
        self.name_of(id).unwrap_or_else(|| format!("#{}", id))
    }

    /// Reserve an id for a new token
    pub fn reserve_id(&self) -> Result<u32> {
        let capacity = self.kind.capacity();
        let id = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id < capacity).then_some(id + 1)
            })
            .map_err(|_| {
                Error::invalid_state(format!(
                    "{:?} token capacity of {} exhausted",
                    self.kind, capacity
                ))
            })?;
        Ok(id)
    }

    /// Persist a token mapping
    pub fn store_token(&self, id: u32, name: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.name_to_id.put(&mut wtxn, name, &id)?;
        self.id_to_name.put(&mut wtxn, &id, name)?;
        wtxn.commit()?;
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
        Ok(())
    }

    /// Remove a persisted token mapping
    pub fn remove_token(&self, id: u32) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let name = self.id_to_name.get(&wtxn, &id)?.map(|n| n.to_string());
        if let Some(name) = name {
            self.name_to_id.delete(&mut wtxn, &name)?;
        }
        self.id_to_name.delete(&mut wtxn, &id)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Read a persisted token name, bypassing the cache
    pub fn stored_name(&self, id: u32) -> Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.id_to_name.get(&rtxn, &id)?.map(|n| n.to_string()))
    }

    /// Publish a token to the caches
    pub fn add_to_cache(&self, id: u32, name: &str) {
        self.name_cache.insert(name.to_string(), id);
        self.id_cache.insert(id, name.to_string());
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// Remove a token from the caches
    pub fn remove_from_cache(&self, id: u32) {
        if let Some((_, name)) = self.id_cache.remove(&id) {
            self.name_cache.remove(&name);
        }
    }

    /// All cached tokens ordered by id
    pub fn all(&self) -> Vec<(u32, String)> {
        let mut tokens: Vec<(u32, String)> = self
            .id_cache
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        tokens.sort_by_key(|(id, _)| *id);
        tokens
    }
}

/// The three token holders
pub struct TokenHolders {
    /// Node labels
    pub labels: TokenHolder,
    /// Relationship types
    pub relationship_types: TokenHolder,
    /// Property keys
    pub property_keys: TokenHolder,
}

impl TokenHolders {
    /// Open all token kinds
    pub fn open(env: &Env) -> Result<Self> {
        Ok(Self {
            labels: TokenHolder::open(env, TokenKind::Label)?,
            relationship_types: TokenHolder::open(env, TokenKind::RelationshipType)?,
            property_keys: TokenHolder::open(env, TokenKind::PropertyKey)?,
        })
    }

    /// Holder for a kind
    pub fn holder(&self, kind: TokenKind) -> &TokenHolder {
        match kind {
            TokenKind::Label => &self.labels,
            TokenKind::RelationshipType => &self.relationship_types,
            TokenKind::PropertyKey => &self.property_keys,
        }
    }

    /// Fill every cache from the catalog
    pub fn init_caches(&self) -> Result<()> {
        let labels = self.labels.init_cache()?;
        let types = self.relationship_types.init_cache()?;
        let keys = self.property_keys.init_cache()?;
        tracing::debug!(
            "Loaded tokens: {} labels, {} relationship types, {} property keys",
            labels,
            types,
            keys
        );
        Ok(())
    }
}
