//! Versioned key/value store over a single redb database file.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use redb::{ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::iter::Iter;
use crate::Error;

/// Entries are `(version, payload)`; a `None` payload is a tombstone.
pub(crate) const ENTRIES: TableDefinition<'static, &'static [u8], (u64, Option<&'static [u8]>)> =
    TableDefinition::new("entries");

const GC_INTERVAL: Duration = Duration::from_secs(10);

/// One ordered namespace. Cheap to clone; the underlying file closes
/// when the last clone (and every open snapshot) is gone.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    db: RwLock<redb::Database>,
}

impl Store {
    /// Opens (or creates) the namespace under `dir/data/` and starts its
    /// compaction loop. The loop stops when `closed` is set or the store
    /// is dropped.
    pub(crate) fn open(dir: &Path, closed: Arc<AtomicBool>) -> Result<Store> {
        let data_dir = dir.join("data");
        std::fs::create_dir_all(&data_dir)?;
        let db = redb::Database::create(data_dir.join("kv.redb"))?;

        // Create the entries table up front so read snapshots never see
        // a missing table.
        let tx = db.begin_write()?;
        tx.open_table(ENTRIES)?;
        tx.commit()?;

        let inner = Arc::new(StoreInner { db: RwLock::new(db) });
        spawn_gc(Arc::downgrade(&inner), closed);
        Ok(Store { inner })
    }

    /// Returns the live `(version, payload)` under `key`, or `None` for
    /// absent keys and tombstones.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let db = self.inner.db.read();
        let tx = db.begin_read()?;
        let table = tx.open_table(ENTRIES)?;
        let Some(guard) = table.get(key)? else {
            return Ok(None);
        };
        let (version, payload) = guard.value();
        Ok(payload.map(|bytes| (version, bytes.to_vec())))
    }

    /// Unconditional write. Returns the new version.
    pub(crate) fn set(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.write(key, Some(value), Expectation::None)
    }

    /// Writes only if no live entry exists, else [`Error::AlreadyExists`].
    pub(crate) fn set_if_absent(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.write(key, Some(value), Expectation::Absent)
    }

    /// Writes only if the live version equals `expected` (0 meaning
    /// absent), else [`Error::CounterChanged`].
    pub(crate) fn compare_and_set(&self, key: &[u8], value: &[u8], expected: u64) -> Result<u64> {
        self.write(key, Some(value), Expectation::Version(expected))
    }

    /// Unconditional delete; absent keys are a no-op.
    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None, Expectation::None).map(|_| ())
    }

    /// Deletes only if the live version equals `expected`, else
    /// [`Error::CounterChanged`].
    pub(crate) fn compare_and_delete(&self, key: &[u8], expected: u64) -> Result<()> {
        self.write(key, None, Expectation::Version(expected))
            .map(|_| ())
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>, expect: Expectation) -> Result<u64> {
        let db = self.inner.db.read();
        let tx = db.begin_write()?;
        let version = {
            let mut table = tx.open_table(ENTRIES)?;
            let (stored, live) = match table.get(key)? {
                Some(guard) => {
                    let (version, payload) = guard.value();
                    (version, payload.is_some())
                }
                None => (0, false),
            };

            match expect {
                Expectation::None => {}
                Expectation::Absent if live => return Err(Error::AlreadyExists),
                Expectation::Absent => {}
                Expectation::Version(expected) => {
                    let current = if live { stored } else { 0 };
                    if current != expected {
                        return Err(Error::CounterChanged);
                    }
                }
            }

            if value.is_none() && !live {
                // Deleting an absent key must not bump the counter.
                return Ok(stored);
            }

            let version = stored + 1;
            table.insert(key, (version, value))?;
            version
        };
        tx.commit()?;
        Ok(version)
    }

    /// Opens a snapshot iterator. The snapshot is consistent: writes
    /// after this call are invisible to it.
    pub(crate) fn iter(&self, reverse: bool) -> Result<Iter> {
        let db = self.inner.db.read();
        let tx = db.begin_read()?;
        let table = tx.open_table(ENTRIES)?;
        Ok(Iter::new(table, reverse))
    }
}

enum Expectation {
    None,
    Absent,
    Version(u64),
}

/// Periodic compaction, the storage engine's value-log GC. Holds only a
/// weak handle so a dropped store ends its loop; a panic inside the
/// engine is logged and stops GC without taking the process down.
fn spawn_gc(inner: Weak<StoreInner>, closed: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("clowder-gc".into())
        .spawn(move || loop {
            thread::sleep(GC_INTERVAL);
            if closed.load(Ordering::Acquire) {
                return;
            }
            let Some(store) = inner.upgrade() else {
                return;
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut db = store.db.write();
                if let Err(err) = db.compact() {
                    // Compaction with open snapshots is refused by the
                    // engine; it will be retried next tick.
                    debug!(error = %err, "storage compaction skipped");
                }
            }));
            if outcome.is_err() {
                warn!("storage compaction panicked; disabling gc for this namespace");
                return;
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn gc thread");
    }
}
