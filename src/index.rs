//! Secondary indexes.
//!
//! An index is declared with a specification string naming what to
//! extract from each document:
//!
//! - a single field path (`Age`) derives one value per document;
//! - a comma-separated compound path (`Age,Name`) derives one ordered
//!   tuple per document;
//! - a path ending in `.*` (`Likes.*`) derives one value per element
//!   of the addressed array, so a document can appear under several
//!   index keys.
//!
//! On disk an index is its own namespace mapping the sort key of each
//! indexed value to a msgpack list of primary keys. Lists are
//! duplicate-free; mutations are read-modify-CAS loops that retry on
//! contention. Reads treat malformed entries as absent and keys whose
//! record has vanished are skipped, so an index damaged by a partial
//! failure degrades instead of poisoning queries.

use std::sync::Arc;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use serde::de::DeserializeOwned;

use crate::database::check_identifier;
use crate::document::{path, Document};
use crate::encoding;
use crate::error::{Error, Result};
use crate::range::Range;
use crate::storage::{Iter, Store};
use crate::table::{SortKeys, Table};
use crate::value::{Bound, Value};
use crate::config::IndexConfig;

const BACKFILL_WORKERS: usize = 20;

pub(crate) struct IndexCore {
    pub(crate) name: String,
    pub(crate) store: Store,
}

/// Handle to a secondary index of a table.
#[derive(Clone)]
pub struct Index {
    table: Table,
    core: Arc<IndexCore>,
}

impl Table {
    /// Creates an index named by its specification and backfills it
    /// from the table's current contents.
    ///
    /// Creation is registered durably before the backfill scan runs;
    /// per-record backfill errors are logged and the index is left
    /// usable.
    pub fn new_index(&self, spec: &str) -> Result<Index> {
        check_identifier(spec)?;
        check_spec(spec)?;

        let store = {
            let mut config = self.db.config.lock();
            let Some(entry) = config.table_mut(self.name()) else {
                return Err(Error::NotFound);
            };
            if entry.has_index(spec) {
                return Err(Error::AlreadyExists);
            }

            let store = self
                .db
                .open_namespace(&[self.name(), spec])?;
            entry.indexes.push(IndexConfig {
                index_name: spec.to_owned(),
            });
            self.db.persist_config(&config)?;
            store
        };

        let core = Arc::new(IndexCore {
            name: spec.to_owned(),
            store,
        });
        self.core
            .indexes
            .write()
            .insert(spec.to_owned(), core.clone());

        let index = Index::from_parts(self.clone(), core);
        if let Err(err) = index.backfill() {
            warn!(
                index = %index.qualified_name(),
                error = %err,
                "error while indexing, index likely corrupt"
            );
        }
        Ok(index)
    }

    /// Drops an index, deleting its namespace from disk.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        {
            let mut config = self.db.config.lock();
            let Some(entry) = config.table_mut(self.name()) else {
                return Err(Error::NotFound);
            };
            let Some(at) = entry.indexes.iter().position(|i| i.index_name == name) else {
                return Err(Error::NotFound);
            };
            entry.indexes.remove(at);
            self.db.persist_config(&config)?;
        }

        self.core.indexes.write().remove(name);
        let dir = self.db.namespace_dir(&[self.name(), name]);
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}

impl Index {
    pub(crate) fn from_parts(table: Table, core: Arc<IndexCore>) -> Index {
        Index { table, core }
    }

    /// The index's specification string, which is also its name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// `table/index`, for log context.
    pub(crate) fn qualified_name(&self) -> String {
        format!("{}/{}", self.table.name(), self.core.name)
    }

    /// All documents whose indexed value equals `value`. Documents
    /// deleted since the index entry was written are skipped.
    pub fn get_all(&self, value: impl Into<Value>) -> Range {
        let sort_key = match encoding::sort_key(&value.into()) {
            Ok(key) => key,
            Err(err) => return Range::failed(err),
        };
        match self.core.store.get(&sort_key) {
            Err(err) => Range::failed(err),
            Ok(None) => Range::empty(),
            Ok(Some((_, list))) => match self.primary_key_range(&list) {
                Ok(range) => range,
                Err(err) => Range::failed(err),
            },
        }
    }

    /// The first document matching `value`, or [`Error::NotFound`].
    /// Indexes are non-unique; use [`get_all`](Self::get_all) for every
    /// match.
    pub fn one<T: DeserializeOwned>(&self, value: impl Into<Value>) -> Result<(String, u64, T)> {
        let mut range = self.get_all(value);
        if !range.next() {
            return match range.error() {
                Some(Error::EndOfRange) | None => Err(Error::NotFound),
                Some(_) => Err(range_error(&range)),
            };
        }
        Ok((range.key().to_owned(), range.counter(), range.decode()?))
    }

    /// Ordered iteration over indexed values in `[lower, upper]`, both
    /// ends inclusive. A document appears once per matching indexed
    /// value, so wildcard indexes can repeat primary keys; deduplicate
    /// with [`Range::unique`]. An inverted range is empty.
    pub fn between(
        &self,
        lower: impl Into<Bound>,
        upper: impl Into<Bound>,
        reverse: bool,
    ) -> Range {
        self.between_bounds(lower.into(), upper.into(), reverse)
    }

    /// Every document with an indexed value, in index order.
    pub fn all(&self, reverse: bool) -> Range {
        self.between(Bound::Min, Bound::Max, reverse)
    }

    /// The number of index entries in `[lower, upper]`, counted from
    /// the list length headers alone. Wildcard indexes can count a
    /// document once per matching value.
    pub fn count_between(&self, lower: impl Into<Bound>, upper: impl Into<Bound>) -> u64 {
        let (lower, upper) = (lower.into(), upper.into());
        if lower == Bound::Max || upper == Bound::Min {
            return 0;
        }
        let lower_key = match encoded_bound(&lower) {
            Ok(key) => key,
            Err(err) => {
                warn!(index = %self.qualified_name(), error = %err, "unencodable bound");
                return 0;
            }
        };
        let upper_key = match encoded_bound(&upper) {
            Ok(key) => key,
            Err(err) => {
                warn!(index = %self.qualified_name(), error = %err, "unencodable bound");
                return 0;
            }
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
                let header = iter.value();
                count += path::decode_array_count(&header[..header.len().min(5)]);
                iter.next()?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!(index = %self.qualified_name(), error = %err, "count_between scan failed");
        }
        count
    }

    fn between_bounds(&self, lower: Bound, upper: Bound, reverse: bool) -> Range {
        if lower == Bound::Max || upper == Bound::Min {
            return Range::empty();
        }
        let lower_key = match encoded_bound(&lower) {
            Ok(key) => key,
            Err(err) => return Range::failed(err),
        };
        let upper_key = match encoded_bound(&upper) {
            Ok(key) => key,
            Err(err) => return Range::failed(err),
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

        // The outer iterator walks index entries; each entry expands
        // into an inner range over its primary-key list, drained and
        // dropped before the outer advances.
        let state = Arc::new(Mutex::new(Some(BetweenState { iter, inner: None })));
        let close_state = state.clone();
        let index = self.clone();
        Range::new(
            Box::new(move || {
                let mut guard = state.lock();
                let Some(st) = guard.as_mut() else {
                    return Err(Error::EndOfRange);
                };
                loop {
                    if let Some(inner) = st.inner.as_mut() {
                        let entry = inner.recv();
                        match entry.err {
                            None => return Ok((entry.key, entry.data, entry.counter)),
                            Some(Error::EndOfRange) => {
                                st.inner = None;
                            }
                            Some(err) => return Err(err),
                        }
                    }

                    if !st.iter.valid() {
                        return Err(Error::EndOfRange);
                    }
                    if !reverse {
                        if let Some(upper) = &upper_key {
                            if st.iter.key() > upper.as_slice() {
                                return Err(Error::EndOfRange);
                            }
                        }
                    } else if let Some(lower) = &lower_key {
                        if st.iter.key() < lower.as_slice() {
                            return Err(Error::EndOfRange);
                        }
                    }

                    let list = st.iter.value().to_vec();
                    st.iter.next()?;
                    match index.primary_key_range(&list) {
                        Ok(range) => st.inner = Some(range),
                        // A corrupt entry reads as absent.
                        Err(_) => continue,
                    }
                }
            }),
            Box::new(move || {
                close_state.lock().take();
            }),
            Some(self.table.clone()),
        )
    }

    /// Builds a range that resolves a primary-key list against the
    /// parent table, skipping keys whose record no longer exists.
    fn primary_key_range(&self, list: &[u8]) -> Result<Range> {
        let keys = self.decode_list(list)?;
        if keys.is_empty() {
            warn!(index = %self.qualified_name(), "corrupt index: empty primary-key list");
            return Err(Error::IndexError);
        }

        let table = self.table.clone();
        let range_table = self.table.clone();
        let mut at = 0;
        Ok(Range::new(
            Box::new(move || loop {
                if at >= keys.len() {
                    return Err(Error::EndOfRange);
                }
                let key = &keys[at];
                at += 1;
                match table.raw_get(key)? {
                    Some((counter, data)) => return Ok((key.clone(), data, counter)),
                    // Record deleted since the entry was written.
                    None => continue,
                }
            }),
            Box::new(|| {}),
            Some(range_table),
        ))
    }

    fn decode_list(&self, list: &[u8]) -> Result<Vec<String>> {
        rmp_serde::from_slice(list).map_err(|err| {
            warn!(
                index = %self.qualified_name(),
                error = %err,
                "corrupt index: undecodable primary-key list"
            );
            Error::IndexError
        })
    }

    // ---- maintenance ------------------------------------------------------

    /// The sort keys this index derives from a document payload. An
    /// absent payload, an unmatched path and an unencodable value all
    /// contribute nothing.
    pub(crate) fn derive_sort_keys(&self, data: Option<&[u8]>) -> SortKeys {
        let mut keys = SortKeys::new();
        let Some(data) = data else {
            return keys;
        };
        for value in self.derive_values(data) {
            match encoding::sort_key(&value) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    warn!(
                        index = %self.qualified_name(),
                        error = %err,
                        "skipping unindexable value"
                    );
                }
            }
        }
        keys
    }

    /// Evaluates the specification against one document.
    fn derive_values(&self, data: &[u8]) -> Vec<Value> {
        let doc = Document::new(data.to_vec(), Some(self.table.clone()));
        let spec = self.core.name.as_str();
        if !spec.contains(',') {
            return doc.query_all(spec);
        }

        // Compound: first match per segment, assembled into a tuple.
        // A document missing any segment is simply not indexed.
        let mut tuple = Vec::new();
        for segment in spec.split(',') {
            match doc.query_one(segment) {
                Some(value) => tuple.push(value),
                None => return Vec::new(),
            }
        }
        vec![Value::Array(tuple)]
    }

    /// Adds `primary` to the list under `sort_key`, retrying CAS
    /// conflicts until it lands. Present keys are left alone.
    pub(crate) fn add_primary(&self, sort_key: &[u8], primary: &str) -> Result<()> {
        loop {
            match self.core.store.get(sort_key)? {
                None => {
                    let data = rmp_serde::to_vec(&[primary])?;
                    match self.core.store.set_if_absent(sort_key, &data) {
                        Err(Error::AlreadyExists) => continue,
                        other => return other.map(|_| ()),
                    }
                }
                Some((counter, list)) => {
                    let mut keys = self.decode_list(&list)?;
                    if keys.iter().any(|key| key == primary) {
                        return Ok(());
                    }
                    keys.push(primary.to_owned());
                    let data = rmp_serde::to_vec(&keys)?;
                    match self.core.store.compare_and_set(sort_key, &data, counter) {
                        Err(Error::CounterChanged) => continue,
                        other => return other.map(|_| ()),
                    }
                }
            }
        }
    }

    /// Removes `primary` from the list under `sort_key`, deleting the
    /// entry once the list empties. A missing entry or key is corrupt
    /// but non-fatal.
    pub(crate) fn remove_primary(&self, sort_key: &[u8], primary: &str) -> Result<()> {
        loop {
            let Some((counter, list)) = self.core.store.get(sort_key)? else {
                warn!(index = %self.qualified_name(), "corrupt index: missing entry on removal");
                return Ok(());
            };
            let mut keys = self.decode_list(&list)?;
            let Some(at) = keys.iter().position(|key| key == primary) else {
                warn!(index = %self.qualified_name(), "corrupt index: key absent on removal");
                return Ok(());
            };
            keys.remove(at);

            if keys.is_empty() {
                match self.core.store.compare_and_delete(sort_key, counter) {
                    Err(Error::CounterChanged) => continue,
                    other => return other,
                }
            }
            let data = rmp_serde::to_vec(&keys)?;
            match self.core.store.compare_and_set(sort_key, &data, counter) {
                Err(Error::CounterChanged) => continue,
                other => return other.map(|_| ()),
            }
        }
    }

    /// Scans the parent table and derives entries for every current
    /// record. Per-record failures are logged and skipped.
    fn backfill(&self) -> Result<()> {
        let index = self.clone();
        let scanned = Arc::new(AtomicU64::new(0));
        self.table.all(false).do_each_with(
            move |key, _, doc| {
                let total = scanned.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 100_000 == 0 {
                    debug!(index = %index.qualified_name(), total, "backfill progress");
                }
                for sort_key in index.derive_sort_keys(Some(doc.bytes())) {
                    if let Err(err) = index.add_primary(&sort_key, key) {
                        warn!(
                            index = %index.qualified_name(),
                            error = %err,
                            "index error during backfill"
                        );
                    }
                }
                Ok(())
            },
            BACKFILL_WORKERS,
        )
    }
}

struct BetweenState {
    iter: Iter,
    inner: Option<Range>,
}

/// Encodes a range bound; sentinels carry no constraint on their side.
fn encoded_bound(bound: &Bound) -> Result<Option<Vec<u8>>> {
    match bound {
        Bound::Min | Bound::Max => Ok(None),
        Bound::Value(value) => encoding::sort_key(value).map(Some),
    }
}

/// A wildcard segment must be the whole specification: mixing `.*`
/// with compound segments would silently index tuples of unrelated
/// arity.
fn check_spec(spec: &str) -> Result<()> {
    if spec.contains(',') && spec.contains('*') {
        return Err(Error::BadIdentifier);
    }
    Ok(())
}

fn range_error(range: &Range) -> Error {
    // The sticky error cannot be moved out through `error()`; map the
    // common cases onto owned values.
    match range.error() {
        Some(Error::IndexError) => Error::IndexError,
        Some(Error::NotFound) => Error::NotFound,
        Some(Error::CounterChanged) => Error::CounterChanged,
        Some(other) => Error::Msg(other.to_string()),
        None => Error::NotFound,
    }
}
