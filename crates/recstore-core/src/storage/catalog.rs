//! LMDB environment shared by the catalog stores
//!
//! Tokens, schema rules, counts, store metadata and explicit indexes each
//! live in named databases of one heed environment under `catalog/`.

use crate::Result;
use heed::{Env, EnvOpenOptions};
use std::path::Path;

/// Maximum number of named databases in the catalog environment
const MAX_DBS: u32 = 16;

/// Open (or create) the catalog environment at `path`
pub fn open_env(path: &Path, map_size: usize) -> Result<Env> {
    std::fs::create_dir_all(path)?;
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(MAX_DBS)
            .open(path)?
    };
    tracing::debug!("Opened catalog environment at {:?} (map_size={})", path, map_size);
    Ok(env)
}
