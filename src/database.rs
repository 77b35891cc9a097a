//! Database bootstrap and table registry.
//!
//! A database is a directory: `config.dat` at the root records the
//! structure, and every table and index owns a subdirectory named by
//! the lowercase hex of its identifier bytes, so any identifier up to
//! 125 bytes is filesystem-safe. Opening reads the configuration and
//! reopens every registered namespace; a directory without a
//! configuration record is an empty database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{self, DbConfig, TableConfig};
use crate::document::compress::Dictionary;
use crate::error::{Error, Result};
use crate::index::IndexCore;
use crate::storage::Store;
use crate::table::{Table, TableCore};

pub(crate) struct DbCore {
    path: PathBuf,
    pub(crate) config: Mutex<DbConfig>,
    tables: RwLock<hashbrown::HashMap<String, Arc<TableCore>>>,
    closed: Arc<AtomicBool>,
}

/// An open database. Handles are cheap to clone and share one
/// underlying instance.
#[derive(Clone)]
pub struct Database {
    core: Arc<DbCore>,
}

impl Database {
    /// Opens the database at `path`, creating the directory if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let config = config::load(&path.join("config.dat"))?.unwrap_or_default();
        let core = Arc::new(DbCore {
            path,
            config: Mutex::new(config.clone()),
            tables: RwLock::new(hashbrown::HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        });

        for table_config in &config.tables {
            let table = core.open_table(table_config)?;
            core.tables
                .write()
                .insert(table_config.table_name.clone(), table);
        }

        Ok(Database { core })
    }

    /// Creates a new table with transparent key compression enabled.
    pub fn new_table(&self, name: &str) -> Result<Table> {
        self.new_table_with(name, true)
    }

    /// Creates a new table. Disable key compression if document field
    /// names are highly dynamic, since the dictionary only grows and
    /// lives in memory.
    pub fn new_table_with(&self, name: &str, key_compression: bool) -> Result<Table> {
        check_identifier(name)?;

        let mut config = self.core.config.lock();
        if config.table(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let store = self.core.open_namespace(&[name])?;
        config.tables.push(TableConfig {
            table_name: name.to_owned(),
            indexes: Vec::new(),
            use_key_compression: key_compression,
            key_compression: Default::default(),
            next_key: "0".to_owned(),
        });
        self.core.persist_config(&config)?;
        drop(config);

        let table = Arc::new(TableCore {
            name: name.to_owned(),
            store,
            indexes: RwLock::new(hashbrown::HashMap::new()),
            compression: key_compression.then(|| RwLock::new(Dictionary::new())),
        });
        self.core.tables.write().insert(name.to_owned(), table.clone());

        Ok(Table {
            db: self.core.clone(),
            core: table,
        })
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<Table> {
        let core = self.core.tables.read().get(name).cloned()?;
        Some(Table {
            db: self.core.clone(),
            core,
        })
    }

    /// The names of every table in the database.
    pub fn tables(&self) -> Vec<String> {
        self.core.tables.read().keys().cloned().collect()
    }

    /// Drops a table, deleting its data and every index it owns.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        {
            let mut config = self.core.config.lock();
            let Some(at) = config.tables.iter().position(|t| t.table_name == name) else {
                return Err(Error::NotFound);
            };
            config.tables.remove(at);
            self.core.persist_config(&config)?;
        }

        self.core.tables.write().remove(name);
        std::fs::remove_dir_all(self.core.namespace_dir(&[name]))?;
        Ok(())
    }

    /// Closes the database: background maintenance stops at its next
    /// tick and the table registry empties. Open ranges finish their
    /// current snapshots.
    pub fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
        self.core.tables.write().clear();
    }

    /// The database's root directory.
    pub fn path(&self) -> &Path {
        &self.core.path
    }
}

impl DbCore {
    fn open_table(&self, table_config: &TableConfig) -> Result<Arc<TableCore>> {
        let store = self.open_namespace(&[table_config.table_name.as_str()])?;

        let mut indexes = hashbrown::HashMap::new();
        for index_config in &table_config.indexes {
            let store = self.open_namespace(&[
                table_config.table_name.as_str(),
                index_config.index_name.as_str(),
            ])?;
            indexes.insert(
                index_config.index_name.clone(),
                Arc::new(IndexCore {
                    name: index_config.index_name.clone(),
                    store,
                }),
            );
        }

        let compression = table_config.use_key_compression.then(|| {
            RwLock::new(Dictionary::from_saved(
                table_config.key_compression.clone(),
                table_config.next_key.clone(),
            ))
        });

        Ok(Arc::new(TableCore {
            name: table_config.table_name.clone(),
            store,
            indexes: RwLock::new(indexes),
            compression,
        }))
    }

    /// Opens the storage namespace for a table (`[table]`) or index
    /// (`[table, index]`).
    pub(crate) fn open_namespace(&self, names: &[&str]) -> Result<Store> {
        Store::open(&self.namespace_dir(names), self.closed.clone())
    }

    pub(crate) fn namespace_dir(&self, names: &[&str]) -> PathBuf {
        let mut dir = self.path.clone();
        for name in names {
            dir.push(hex_name(name));
        }
        dir
    }

    /// Rewrites `config.dat`. Callers hold the config mutex.
    pub(crate) fn persist_config(&self, config: &DbConfig) -> Result<()> {
        config::save(&self.path.join("config.dat"), config)
    }
}

impl Drop for DbCore {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Table and index names must be non-empty and at most 125 bytes.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 125 {
        return Err(Error::BadIdentifier);
    }
    Ok(())
}

fn hex_name(name: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(name.len() * 2);
    for byte in name.as_bytes() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_names_are_lowercase_hex_of_the_bytes() {
        assert_eq!(hex_name("ab"), "6162");
        assert_eq!(hex_name("Age"), "416765");
    }

    #[test]
    fn identifier_limits() {
        assert!(check_identifier("people").is_ok());
        assert!(matches!(check_identifier(""), Err(Error::BadIdentifier)));
        assert!(check_identifier(&"x".repeat(125)).is_ok());
        assert!(matches!(
            check_identifier(&"x".repeat(126)),
            Err(Error::BadIdentifier)
        ));
    }
}
