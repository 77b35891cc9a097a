//! Tables: primary-keyed document storage.
//!
//! A table maps string primary keys to encoded documents. Every write
//! carries a version counter assigned by the storage layer; conditional
//! writes compare against it, and [`Table::update`] builds the
//! canonical optimistic retry loop on top. Every mutation also drives
//! the table's secondary indexes: the indexed values of the pre- and
//! post-image are diffed and the per-index key lists patched to match.
//!
//! Index maintenance deliberately never rolls back the primary write.
//! A failed index patch is logged with context and surfaced to the
//! caller, leaving the index to self-heal on later reads and writes.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::warn;

use crate::document::{compress, Document};
use crate::error::{Error, Result};
use crate::index::{Index, IndexCore};
use crate::range::Range;
use crate::storage::Store;
use crate::value::{Bound, Value};
use crate::database::DbCore;

/// Encoded index values derived from one document under one index.
pub(crate) type SortKeys = SmallVec<[Vec<u8>; 4]>;

pub(crate) struct TableCore {
    pub(crate) name: String,
    pub(crate) store: Store,
    pub(crate) indexes: RwLock<hashbrown::HashMap<String, Arc<IndexCore>>>,
    pub(crate) compression: Option<RwLock<compress::Dictionary>>,
}

/// Handle to a table. Cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct Table {
    pub(crate) db: Arc<DbCore>,
    pub(crate) core: Arc<TableCore>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// The table's name as registered in the database.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Retrieves a document by primary key, returning it alongside its
    /// version counter. [`Error::NotFound`] if the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<(T, u64)> {
        let (counter, data) = self.raw_get(key)?.ok_or(Error::NotFound)?;
        let doc = Document::new(data, Some(self.clone()));
        Ok((doc.decode()?, counter))
    }

    /// The version counter of a key: an existence check that skips
    /// decoding. [`Error::NotFound`] if the key is absent.
    pub fn counter(&self, key: &str) -> Result<u64> {
        Ok(self.raw_get(key)?.ok_or(Error::NotFound)?.0)
    }

    /// The raw encoded document under `key`, if any.
    pub fn document(&self, key: &str) -> Result<(Document, u64)> {
        let (counter, data) = self.raw_get(key)?.ok_or(Error::NotFound)?;
        Ok((Document::new(data, Some(self.clone())), counter))
    }

    /// Stores a document unconditionally.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        check_primary_key(key)?;
        let data = self.marshal(value)?;
        let old = self.raw_get(key)?;
        self.core.store.set(key.as_bytes(), &data)?;
        self.update_indexes(key, old.as_ref().map(|(_, d)| d.as_slice()), Some(&data))
    }

    /// Stores a document only if the key's current counter equals
    /// `counter`; 0 means the key must not exist. Returns
    /// [`Error::CounterChanged`] on mismatch.
    pub fn set_checked<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        counter: u64,
    ) -> Result<()> {
        check_primary_key(key)?;
        let data = self.marshal(value)?;
        let old = self.raw_get(key)?;
        if old.as_ref().map_or(0, |(c, _)| *c) != counter {
            return Err(Error::CounterChanged);
        }
        match self.core.store.compare_and_set(key.as_bytes(), &data, counter) {
            Ok(_) => {}
            Err(Error::AlreadyExists) | Err(Error::CounterChanged) => {
                return Err(Error::CounterChanged);
            }
            Err(err) => return Err(err),
        }
        self.update_indexes(key, old.as_ref().map(|(_, d)| d.as_slice()), Some(&data))
    }

    /// Deletes a key; absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        let Some((_, old)) = self.raw_get(key)? else {
            return Ok(());
        };
        self.core.store.delete(key.as_bytes())?;
        self.update_indexes(key, Some(&old), None)
    }

    /// Deletes a key only if its counter equals `counter`.
    pub fn delete_checked(&self, key: &str, counter: u64) -> Result<()> {
        let Some((current, old)) = self.raw_get(key)? else {
            return Ok(());
        };
        if current != counter {
            return Err(Error::CounterChanged);
        }
        match self.core.store.compare_and_delete(key.as_bytes(), counter) {
            Ok(()) => {}
            Err(Error::CounterChanged) => return Err(Error::CounterChanged),
            Err(err) => return Err(err),
        }
        self.update_indexes(key, Some(&old), None)
    }

    /// Read-modify-write with optimistic retries.
    ///
    /// Reads the document, applies `modify`, and writes back only if
    /// the counter is unchanged; on a concurrent write the whole cycle
    /// reruns, so `modify` must be free of side effects. An error from
    /// `modify` aborts and is returned verbatim. [`Error::NotFound`] if
    /// the key does not exist.
    pub fn update<T, F>(&self, key: &str, mut modify: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(T) -> Result<T>,
    {
        loop {
            let (current, counter) = self.get::<T>(key)?;
            let next = modify(current)?;
            match self.set_checked(key, &next, counter) {
                Err(Error::CounterChanged) => continue,
                other => return other,
            }
        }
    }

    /// Ordered iteration over primary keys in `[lower, upper]`, both
    /// ends inclusive. Bounds must be strings or the [`Bound`]
    /// sentinels; anything else yields an empty range with a warning.
    /// An inverted range is empty.
    pub fn between(
        &self,
        lower: impl Into<Bound>,
        upper: impl Into<Bound>,
        reverse: bool,
    ) -> Range {
        self.between_bounds(lower.into(), upper.into(), reverse)
    }

    /// Every document in the table, in primary-key order.
    pub fn all(&self, reverse: bool) -> Range {
        self.between(Bound::Min, Bound::Max, reverse)
    }

    /// The number of keys in `[lower, upper]` without materializing
    /// documents.
    pub fn count_between(&self, lower: impl Into<Bound>, upper: impl Into<Bound>) -> u64 {
        let (lower, upper) = (lower.into(), upper.into());
        if lower == Bound::Max || upper == Bound::Min {
            return 0;
        }
        let (Ok(lower_key), Ok(upper_key)) = (string_bound(&lower), string_bound(&upper)) else {
            warn!(
                table = %self.core.name,
                "count_between bounds must be strings or sentinels; returning 0"
            );
            return 0;
        };

        let mut count = 0;
        let result = (|| -> Result<()> {
            let mut iter = self.core.store.iter(false)?;
            match &lower_key {
                None => iter.rewind()?,
                Some(key) => iter.seek(key)?,
            }
            while iter.valid() {
                if let Some(upper) = &upper_key {
                    if iter.key() > upper.as_slice() {
                        break;
                    }
                }
                count += 1;
                iter.next()?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!(table = %self.core.name, error = %err, "count_between scan failed");
        }
        count
    }

    /// The names of this table's indexes.
    pub fn indexes(&self) -> Vec<String> {
        self.core.indexes.read().keys().cloned().collect()
    }

    /// Looks up an index by name.
    pub fn index(&self, name: &str) -> Option<Index> {
        let core = self.core.indexes.read().get(name).cloned()?;
        Some(Index::from_parts(self.clone(), core))
    }

    fn between_bounds(&self, lower: Bound, upper: Bound, reverse: bool) -> Range {
        if lower == Bound::Max || upper == Bound::Min {
            return Range::empty();
        }
        let (Ok(lower_key), Ok(upper_key)) = (string_bound(&lower), string_bound(&upper)) else {
            warn!(
                table = %self.core.name,
                "between bounds must be strings or sentinels; returning an empty range"
            );
            return Range::empty();
        };

        let mut iter = match self.core.store.iter(reverse) {
            Ok(iter) => iter,
            Err(err) => return Range::failed(err),
        };
        let positioned = if reverse {
            match &upper_key {
                None => iter.rewind(),
                Some(key) => iter.seek(key),
            }
        } else {
            match &lower_key {
                None => iter.rewind(),
                Some(key) => iter.seek(key),
            }
        };
        if let Err(err) = positioned {
            return Range::failed(err);
        }

        let state = Arc::new(Mutex::new(Some(iter)));
        let close_state = state.clone();
        Range::new(
            Box::new(move || {
                let mut guard = state.lock();
                let Some(iter) = guard.as_mut() else {
                    return Err(Error::EndOfRange);
                };
                if !iter.valid() {
                    return Err(Error::EndOfRange);
                }
                if !reverse {
                    if let Some(upper) = &upper_key {
                        if iter.key() > upper.as_slice() {
                            return Err(Error::EndOfRange);
                        }
                    }
                } else if let Some(lower) = &lower_key {
                    if iter.key() < lower.as_slice() {
                        return Err(Error::EndOfRange);
                    }
                }
                let key = String::from_utf8_lossy(iter.key()).into_owned();
                let data = iter.value().to_vec();
                let counter = iter.version();
                iter.next()?;
                Ok((key, data, counter))
            }),
            Box::new(move || {
                // Dropping the iterator releases its storage snapshot.
                close_state.lock().take();
            }),
            Some(self.clone()),
        )
    }

    pub(crate) fn raw_get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>> {
        self.core.store.get(key.as_bytes())
    }

    // ---- index maintenance ------------------------------------------------

    /// Applies the index diff between the pre- and post-image of `key`.
    /// Failures are logged and the last one returned; the primary write
    /// stands regardless.
    pub(crate) fn update_indexes(
        &self,
        key: &str,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        let indexes: Vec<Arc<IndexCore>> = self.core.indexes.read().values().cloned().collect();
        let mut last_err = None;

        for core in indexes {
            let index = Index::from_parts(self.clone(), core);
            let old_keys = index.derive_sort_keys(old);
            let new_keys = index.derive_sort_keys(new);

            for removal in one_way_diff(&old_keys, &new_keys) {
                if let Err(err) = index.remove_primary(removal, key) {
                    warn!(
                        index = %index.qualified_name(),
                        error = %err,
                        "error while updating index, index likely corrupt"
                    );
                    last_err = Some(err);
                }
            }
            for addition in one_way_diff(&new_keys, &old_keys) {
                if let Err(err) = index.add_primary(addition, key) {
                    warn!(
                        index = %index.qualified_name(),
                        error = %err,
                        "error while updating index, index likely corrupt"
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- key compression --------------------------------------------------

    pub(crate) fn is_compressed(&self) -> bool {
        self.core.compression.is_some()
    }

    /// Serializes a record, routing field names through the compression
    /// dictionary when the table uses one.
    pub(crate) fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = rmp_serde::to_vec_named(value)?;
        if self.core.compression.is_none() {
            return Ok(raw);
        }
        let tree = rmpv::decode::read_value(&mut raw.as_slice())?;
        let compressed = compress::compress_tree(tree, &mut |key| self.key_to_token(key, true))?;
        let mut out = Vec::with_capacity(raw.len());
        rmpv::encode::write_value(&mut out, &compressed)?;
        Ok(out)
    }

    /// Rewrites a compressed payload back to full field names. Unknown
    /// tokens are kept as-is with a warning rather than failing the
    /// read.
    pub(crate) fn expand_payload(&self, data: &[u8]) -> Result<Vec<u8>> {
        let tree = rmpv::decode::read_value(&mut &data[..])?;
        let expanded = compress::expand_tree(tree, &mut |token| match self.lookup_key(token) {
            Some(key) => key,
            None => {
                warn!(
                    table = %self.core.name,
                    token,
                    "failed to decompress non-existent compressed key"
                );
                token.to_owned()
            }
        });
        let mut out = Vec::with_capacity(data.len());
        rmpv::encode::write_value(&mut out, &expanded)?;
        Ok(out)
    }

    /// The token for a field name, without growing the dictionary.
    pub(crate) fn lookup_token(&self, key: &str) -> Option<String> {
        let dict = self.core.compression.as_ref()?.read();
        dict.token(key).map(str::to_owned)
    }

    fn lookup_key(&self, token: &str) -> Option<String> {
        let dict = self.core.compression.as_ref()?.read();
        dict.key_for(token).map(str::to_owned)
    }

    /// The token for a field name, growing and persisting the
    /// dictionary on first sight when `generate` is set. The growth is
    /// rolled back if the configuration write fails.
    fn key_to_token(&self, key: &str, generate: bool) -> Result<String> {
        let Some(lock) = &self.core.compression else {
            return Ok(key.to_owned());
        };

        {
            let dict = lock.read();
            if let Some(token) = dict.token(key) {
                return Ok(token.to_owned());
            }
        }
        if !generate {
            return Err(Error::NotFound);
        }

        let mut dict = lock.write();
        // Another writer may have grown the dictionary first.
        if let Some(token) = dict.token(key) {
            return Ok(token.to_owned());
        }
        let token = dict.assign(key);
        let (mapping, next_key) = dict.snapshot();

        let mut config = self.db.config.lock();
        let Some(entry) = config.table_mut(&self.core.name) else {
            dict.unassign(key, &token);
            return Err(Error::NotFound);
        };
        entry.key_compression = mapping;
        entry.next_key = next_key;
        if let Err(err) = self.db.persist_config(&config) {
            dict.unassign(key, &token);
            return Err(err);
        }
        Ok(token)
    }
}

/// Entries of `a` that have no byte-equal counterpart in `b`.
fn one_way_diff<'a>(a: &'a SortKeys, b: &'a SortKeys) -> impl Iterator<Item = &'a [u8]> {
    a.iter()
        .filter(move |key| !b.iter().any(|other| other == *key))
        .map(Vec::as_slice)
}

fn check_primary_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 125 {
        return Err(Error::BadIdentifier);
    }
    Ok(())
}

/// Extracts the raw key bytes of a string bound; sentinels map to
/// `None` (no constraint on that side).
fn string_bound(bound: &Bound) -> std::result::Result<Option<Vec<u8>>, ()> {
    match bound {
        Bound::Min | Bound::Max => Ok(None),
        Bound::Value(Value::Str(s)) => Ok(Some(s.clone().into_bytes())),
        Bound::Value(_) => Err(()),
    }
}
