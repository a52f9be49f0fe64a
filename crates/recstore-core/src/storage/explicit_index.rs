//! Explicit (user-managed, named) indexes
//!
//! An explicit index maps (key, value) pairs to entity ids. Definitions and
//! entries live in the catalog; all commands of one transaction are applied
//! in a single catalog write transaction.

use crate::{Error, Result};
use heed::types::*;
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Entity kind an explicit index holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEntityType {
    /// Node index
    Node,
    /// Relationship index
    Relationship,
}

/// Change to an explicit index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplicitIndexCommand {
    /// Create a named index
    Create {
        /// Index name
        name: String,
        /// Entity kind
        entity: IndexEntityType,
    },
    /// Drop a named index and its entries
    Delete {
        /// Index name
        name: String,
    },
    /// Add an entity under (key, value)
    Add {
        /// Index name
        name: String,
        /// Entity id
        entity_id: u64,
        /// Entry key
        key: String,
        /// Entry value
        value: String,
    },
    /// Remove an entity from (key, value)
    Remove {
        /// Index name
        name: String,
        /// Entity id
        entity_id: u64,
        /// Entry key
        key: String,
        /// Entry value
        value: String,
    },
}

impl ExplicitIndexCommand {
    /// Index the command targets
    pub fn index_name(&self) -> &str {
        match self {
            ExplicitIndexCommand::Create { name, .. }
            | ExplicitIndexCommand::Delete { name }
            | ExplicitIndexCommand::Add { name, .. }
            | ExplicitIndexCommand::Remove { name, .. } => name,
        }
    }
}

type EntryKey = (String, String, String);

/// Catalog-backed explicit index store
pub struct ExplicitIndexStore {
    env: Env,
    definitions: Database<Str, SerdeBincode<IndexEntityType>>,
    entries: Database<SerdeBincode<EntryKey>, SerdeBincode<BTreeSet<u64>>>,
}

impl ExplicitIndexStore {
    /// Open the explicit index databases
    pub fn open(env: &Env) -> Result<Self> {
        let mut wtxn = env.write_txn()?;
        let definitions = env.create_database(&mut wtxn, Some("explicit_index_defs"))?;
        let entries = env.create_database(&mut wtxn, Some("explicit_index_entries"))?;
        wtxn.commit()?;
        Ok(Self {
            env: env.clone(),
            definitions,
            entries,
        })
    }

    /// Entity kind of a named index
    pub fn definition(&self, name: &str) -> Result<Option<IndexEntityType>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.definitions.get(&rtxn, name)?)
    }

    /// Names of all explicit indexes
    pub fn index_names(&self) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut names = Vec::new();
        for result in self.definitions.iter(&rtxn)? {
            let (name, _) = result?;
            names.push(name.to_string());
        }
        Ok(names)
    }

    /// Entities stored under (key, value) in `name`
    pub fn get(&self, name: &str, key: &str, value: &str) -> Result<Vec<u64>> {
        let rtxn = self.env.read_txn()?;
        let entry = (name.to_string(), key.to_string(), value.to_string());
        Ok(self
            .entries
            .get(&rtxn, &entry)?
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default())
    }

    /// Apply one transaction's commands atomically
    pub fn apply(&self, commands: &[ExplicitIndexCommand]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        for command in commands {
            match command {
                ExplicitIndexCommand::Create { name, entity } => {
                    self.definitions.put(&mut wtxn, name, entity)?;
                }
                ExplicitIndexCommand::Delete { name } => {
                    self.definitions.delete(&mut wtxn, name)?;
                    let doomed: Vec<EntryKey> = self
                        .entries
                        .iter(&wtxn)?
                        .filter_map(|r| r.ok().map(|(k, _)| k))
                        .filter(|(index, _, _)| index == name)
                        .collect();
                    for key in doomed {
                        self.entries.delete(&mut wtxn, &key)?;
                    }
                }
                ExplicitIndexCommand::Add {
                    name,
                    entity_id,
                    key,
                    value,
                } => {
                    if self.definitions.get(&wtxn, name)?.is_none() {
                        return Err(Error::not_found(format!("explicit index '{}'", name)));
                    }
                    let entry = (name.clone(), key.clone(), value.clone());
                    let mut ids = self.entries.get(&wtxn, &entry)?.unwrap_or_default();
                    ids.insert(*entity_id);
                    self.entries.put(&mut wtxn, &entry, &ids)?;
                }
                ExplicitIndexCommand::Remove {
                    name,
                    entity_id,
                    key,
                    value,
                } => {
                    let entry = (name.clone(), key.clone(), value.clone());
                    if let Some(mut ids) = self.entries.get(&wtxn, &entry)? {
                        ids.remove(entity_id);
                        if ids.is_empty() {
                            self.entries.delete(&mut wtxn, &entry)?;
                        } else {
                            self.entries.put(&mut wtxn, &entry, &ids)?;
                        }
                    }
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::open_env;
    use tempfile::TempDir;

    fn create_test_index_store() -> (ExplicitIndexStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = open_env(&dir.path().join("catalog"), 8 * 1024 * 1024).unwrap();
        (ExplicitIndexStore::open(&env).unwrap(), dir)
    }

    fn add(name: &str, id: u64, value: &str) -> ExplicitIndexCommand {
        ExplicitIndexCommand::Add {
            name: name.into(),
            entity_id: id,
            key: "email".into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_create_add_get() {
        let (store, _dir) = create_test_index_store();
        store
            .apply(&[
                ExplicitIndexCommand::Create {
                    name: "users".into(),
                    entity: IndexEntityType::Node,
                },
                add("users", 3, "a@x"),
                add("users", 1, "a@x"),
            ])
            .unwrap();

        assert_eq!(store.get("users", "email", "a@x").unwrap(), vec![1, 3]);
        assert_eq!(store.definition("users").unwrap(), Some(IndexEntityType::Node));
        assert_eq!(store.index_names().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_add_to_missing_index_rolls_back_batch() {
        let (store, _dir) = create_test_index_store();
        let result = store.apply(&[
            ExplicitIndexCommand::Create {
                name: "a".into(),
                entity: IndexEntityType::Node,
            },
            add("missing", 1, "v"),
        ]);
        assert!(result.is_err());
        assert_eq!(store.definition("a").unwrap(), None);
    }

    #[test]
    fn test_remove_and_delete() {
        let (store, _dir) = create_test_index_store();
        store
            .apply(&[
                ExplicitIndexCommand::Create {
                    name: "users".into(),
                    entity: IndexEntityType::Node,
                },
                add("users", 1, "a@x"),
                add("users", 2, "b@x"),
            ])
            .unwrap();

        store
            .apply(&[ExplicitIndexCommand::Remove {
                name: "users".into(),
                entity_id: 1,
                key: "email".into(),
                value: "a@x".into(),
            }])
            .unwrap();
        assert!(store.get("users", "email", "a@x").unwrap().is_empty());

        store
            .apply(&[ExplicitIndexCommand::Delete {
                name: "users".into(),
            }])
            .unwrap();
        assert!(store.get("users", "email", "b@x").unwrap().is_empty());
        assert_eq!(store.definition("users").unwrap(), None);
    }
}
