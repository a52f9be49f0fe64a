//! Schema rules: indexes and constraints
//!
//! Rules are persisted in the catalog keyed by rule id. The schema cache is
//! the in-memory view that command creation and constraint enforcement read.

use crate::storage::token::{KeyId, LabelId};
use crate::Result;
use heed::types::*;
use heed::{Database, Env, byteorder};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a schema rule describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaRuleKind {
    /// Property index on (label, key); unique when owned by a uniqueness constraint
    Index {
        /// Indexed label
        label_id: LabelId,
        /// Indexed property key
        property_key_id: KeyId,
        /// Uniqueness constraint owning this index
        owning_constraint: Option<u64>,
    },
    /// At most one node per label with a given property value
    UniquenessConstraint {
        /// Constrained label
        label_id: LabelId,
        /// Constrained property key
        property_key_id: KeyId,
        /// Index backing the constraint
        owned_index: u64,
    },
    /// Every node with the label must have the property
    ExistenceConstraint {
        /// Constrained label
        label_id: LabelId,
        /// Required property key
        property_key_id: KeyId,
    },
}

/// A persisted schema rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRule {
    /// Rule id
    pub id: u64,
    /// Rule definition
    pub kind: SchemaRuleKind,
}

impl SchemaRule {
    /// Label the rule applies to
    pub fn label_id(&self) -> LabelId {
        match self.kind {
            SchemaRuleKind::Index { label_id, .. }
            | SchemaRuleKind::UniquenessConstraint { label_id, .. }
            | SchemaRuleKind::ExistenceConstraint { label_id, .. } => label_id,
        }
    }

    /// Property key the rule applies to
    pub fn property_key_id(&self) -> KeyId {
        match self.kind {
            SchemaRuleKind::Index {
                property_key_id, ..
            }
            | SchemaRuleKind::UniquenessConstraint {
                property_key_id, ..
            }
            | SchemaRuleKind::ExistenceConstraint {
                property_key_id, ..
            } => property_key_id,
        }
    }

    /// Whether the rule is an index
    pub fn is_index(&self) -> bool {
        matches!(self.kind, SchemaRuleKind::Index { .. })
    }

    /// Whether the rule is a constraint
    pub fn is_constraint(&self) -> bool {
        !self.is_index()
    }

    /// Whether the rule is an index backing a uniqueness constraint
    pub fn is_unique_index(&self) -> bool {
        matches!(
            self.kind,
            SchemaRuleKind::Index {
                owning_constraint: Some(_),
                ..
            }
        )
    }

    /// Whether two rules describe the same schema object, ignoring ids
    pub fn same_definition(&self, other: &SchemaRule) -> bool {
        self.label_id() == other.label_id()
            && self.property_key_id() == other.property_key_id()
            && std::mem::discriminant(&self.kind) == std::mem::discriminant(&other.kind)
    }
}

/// Persisted schema rules
pub struct SchemaStore {
    env: Env,
    rules: Database<U64<byteorder::BigEndian>, SerdeBincode<SchemaRule>>,
    next_id: AtomicU64,
}

impl SchemaStore {
    /// Open the schema database
    pub fn open(env: &Env) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let rules: Database<U64<byteorder::BigEndian>, SerdeBincode<SchemaRule>> =
            env.create_database(&mut wtxn, Some("schema_rules"))?;
        wtxn.commit()?;

        let store = Self {
            env: env.clone(),
            rules,
            next_id: AtomicU64::new(0),
        };
        let next = store.load_all_rules()?.last().map(|r| r.id + 1).unwrap_or(0);
        store.next_id.store(next, Ordering::SeqCst);
        Ok(store)
    }

    /// All rules ordered by id
    pub fn load_all_rules(&self) -> Result<Vec<SchemaRule>> {
        let rtxn = self.env.read_txn()?;
        let mut rules = Vec::new();
        for result in self.rules.iter(&rtxn)? {
            let (_, rule) = result?;
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Read one rule
    pub fn get(&self, id: u64) -> Result<Option<SchemaRule>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.rules.get(&rtxn, &id)?)
    }

    /// Persist a rule
    pub fn put(&self, rule: &SchemaRule) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.rules.put(&mut wtxn, &rule.id, rule)?;
        wtxn.commit()?;
        self.next_id.fetch_max(rule.id + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove a rule
    pub fn delete(&self, id: u64) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.rules.delete(&mut wtxn, &id)?;
        wtxn.commit()?;
        Ok(existed)
    }

    /// Reserve a rule id
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Raise the next id past `id`
    pub fn mark_used(&self, id: u64) {
        self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// Next id that would be reserved
    pub fn high_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

/// In-memory schema view
#[derive(Debug, Default)]
pub struct SchemaCache {
    rules: RwLock<BTreeMap<u64, SchemaRule>>,
}

impl SchemaCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache content
    pub fn load(&self, rules: impl IntoIterator<Item = SchemaRule>) {
        let mut cached = self.rules.write();
        cached.clear();
        for rule in rules {
            cached.insert(rule.id, rule);
        }
    }

    /// Add or replace a rule
    pub fn add_schema_rule(&self, rule: SchemaRule) {
        self.rules.write().insert(rule.id, rule);
    }

    /// Remove a rule
    pub fn remove_schema_rule(&self, id: u64) -> Option<SchemaRule> {
        self.rules.write().remove(&id)
    }

    /// Rule by id
    pub fn rule(&self, id: u64) -> Option<SchemaRule> {
        self.rules.read().get(&id).cloned()
    }

    /// All rules ordered by id
    pub fn rules(&self) -> Vec<SchemaRule> {
        self.rules.read().values().cloned().collect()
    }

    /// All index rules
    pub fn indexes(&self) -> Vec<SchemaRule> {
        self.rules.read().values().filter(|r| r.is_index()).cloned().collect()
    }

    /// Index on (label, key)
    pub fn index_for(&self, label_id: LabelId, key_id: KeyId) -> Option<SchemaRule> {
        self.rules
            .read()
            .values()
            .find(|r| r.is_index() && r.label_id() == label_id && r.property_key_id() == key_id)
            .cloned()
    }

    /// Indexes whose label is `label_id`
    pub fn indexes_for_label(&self, label_id: LabelId) -> Vec<SchemaRule> {
        self.rules
            .read()
            .values()
            .filter(|r| r.is_index() && r.label_id() == label_id)
            .cloned()
            .collect()
    }

    /// Uniqueness constraint on (label, key)
    pub fn uniqueness_constraint(&self, label_id: LabelId, key_id: KeyId) -> Option<SchemaRule> {
        self.rules
            .read()
            .values()
            .find(|r| {
                matches!(r.kind, SchemaRuleKind::UniquenessConstraint { .. })
                    && r.label_id() == label_id
                    && r.property_key_id() == key_id
            })
            .cloned()
    }

    /// Property keys with a uniqueness constraint for `label_id`
    pub fn unique_keys_for_label(&self, label_id: LabelId) -> Vec<KeyId> {
        self.rules
            .read()
            .values()
            .filter(|r| {
                matches!(r.kind, SchemaRuleKind::UniquenessConstraint { .. }) && r.label_id() == label_id
            })
            .map(|r| r.property_key_id())
            .collect()
    }

    /// Property keys required on nodes with `label_id`
    pub fn required_keys_for_label(&self, label_id: LabelId) -> Vec<KeyId> {
        self.rules
            .read()
            .values()
            .filter(|r| {
                matches!(r.kind, SchemaRuleKind::ExistenceConstraint { .. }) && r.label_id() == label_id
            })
            .map(|r| r.property_key_id())
            .collect()
    }

    /// A rule with the same definition as `rule`, if any
    pub fn find_equivalent(&self, rule: &SchemaRule) -> Option<SchemaRule> {
        self.rules
            .read()
            .values()
            .find(|r| r.same_definition(rule))
            .cloned()
    }

    /// Number of cached rules
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether the cache holds no rules
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::open_env;
    use tempfile::TempDir;

    fn index(id: u64, label_id: u32, property_key_id: u32) -> SchemaRule {
        SchemaRule {
            id,
            kind: SchemaRuleKind::Index {
                label_id,
                property_key_id,
                owning_constraint: None,
            },
        }
    }

    #[test]
    fn test_schema_store_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog");
        {
            let env = open_env(&path, 8 * 1024 * 1024).unwrap();
            let store = SchemaStore::open(&env).unwrap();
            assert_eq!(store.reserve_id(), 0);
            store.put(&index(0, 1, 2)).unwrap();
            store.put(&index(5, 1, 3)).unwrap();
            assert!(store.delete(0).unwrap());
        }

        let env = open_env(&path, 8 * 1024 * 1024).unwrap();
        let store = SchemaStore::open(&env).unwrap();
        let rules = store.load_all_rules().unwrap();
        assert_eq!(rules, vec![index(5, 1, 3)]);
        assert_eq!(store.reserve_id(), 6);
    }

    #[test]
    fn test_cache_lookups() {
        let cache = SchemaCache::new();
        cache.load(vec![
            index(1, 0, 0),
            SchemaRule {
                id: 2,
                kind: SchemaRuleKind::UniquenessConstraint {
                    label_id: 0,
                    property_key_id: 1,
                    owned_index: 3,
                },
            },
            SchemaRule {
                id: 4,
                kind: SchemaRuleKind::ExistenceConstraint {
                    label_id: 0,
                    property_key_id: 2,
                },
            },
        ]);

        assert_eq!(cache.index_for(0, 0).unwrap().id, 1);
        assert!(cache.index_for(0, 1).is_none());
        assert_eq!(cache.uniqueness_constraint(0, 1).unwrap().id, 2);
        assert_eq!(cache.unique_keys_for_label(0), vec![1]);
        assert_eq!(cache.required_keys_for_label(0), vec![2]);
        assert!(cache.find_equivalent(&index(99, 0, 0)).is_some());

        cache.remove_schema_rule(1);
        assert!(cache.index_for(0, 0).is_none());
        assert_eq!(cache.len(), 2);
    }
}
