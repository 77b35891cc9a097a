//! Persisted database configuration.
//!
//! `config.dat` at the database root is a msgpack record listing every
//! table, its indexes, and its key-compression dictionary. It is
//! rewritten in full on every structural change (table/index create or
//! drop, dictionary growth), always under the database config mutex.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct DbConfig {
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct TableConfig {
    pub table_name: String,
    pub indexes: Vec<IndexConfig>,
    pub use_key_compression: bool,
    pub key_compression: HashMap<String, String>,
    pub next_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct IndexConfig {
    pub index_name: String,
}

impl DbConfig {
    pub(crate) fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut TableConfig> {
        self.tables.iter_mut().find(|t| t.table_name == name)
    }
}

impl TableConfig {
    pub(crate) fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.index_name == name)
    }
}

/// Reads the configuration record; `Ok(None)` when the file does not
/// exist (a freshly created database).
pub(crate) fn load(path: &Path) -> Result<Option<DbConfig>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(rmp_serde::from_slice(&data)?))
}

/// Rewrites the configuration record. Caller holds the config mutex.
pub(crate) fn save(path: &Path, config: &DbConfig) -> Result<()> {
    let data = rmp_serde::to_vec_named(config)?;
    std::fs::write(path, data)?;
    Ok(())
}
