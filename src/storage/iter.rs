//! Seekable snapshot iterators over a namespace.
//!
//! The interface mirrors what range producers drive: position with
//! `rewind` or `seek`, then loop on `valid`/`key`/`version`/`value`/
//! `next`. A reverse iterator walks keys in descending order and
//! `seek(k)` positions it at the largest key ≤ `k`. Tombstones are
//! skipped transparently, so a valid iterator always sits on a live
//! entry.

use redb::ReadOnlyTable;

use crate::error::{Error, Result};

type EntryTable = ReadOnlyTable<&'static [u8], (u64, Option<&'static [u8]>)>;
type EntryRange = redb::Range<'static, &'static [u8], (u64, Option<&'static [u8]>)>;

pub(crate) struct Iter {
    table: EntryTable,
    reverse: bool,
    range: Option<EntryRange>,
    current: Option<Entry>,
}

struct Entry {
    key: Vec<u8>,
    version: u64,
    value: Vec<u8>,
}

impl Iter {
    pub(crate) fn new(table: EntryTable, reverse: bool) -> Iter {
        Iter {
            table,
            reverse,
            range: None,
            current: None,
        }
    }

    /// Positions at the first entry in iteration order.
    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.range = Some(self.table.range::<&[u8]>(..)?);
        self.advance()
    }

    /// Positions at the first entry at or beyond `key` in iteration
    /// order: the smallest key ≥ `key` forward, the largest key ≤ `key`
    /// in reverse.
    pub(crate) fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.range = Some(if self.reverse {
            self.table.range::<&[u8]>(..=key)?
        } else {
            self.table.range::<&[u8]>(key..)?
        });
        self.advance()
    }

    pub(crate) fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Advances to the next live entry. Calling past the end is a no-op
    /// that leaves the iterator invalid.
    pub(crate) fn next(&mut self) -> Result<()> {
        self.advance()
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.entry().key.as_slice()
    }

    pub(crate) fn version(&self) -> u64 {
        self.entry().version
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.entry().value.as_slice()
    }

    fn entry(&self) -> &Entry {
        self.current
            .as_ref()
            .expect("iterator accessed while invalid")
    }

    fn advance(&mut self) -> Result<()> {
        let Some(range) = self.range.as_mut() else {
            return Err(Error::Codec("iterator used before positioning".into()));
        };
        loop {
            let item = if self.reverse {
                range.next_back()
            } else {
                range.next()
            };
            let Some(item) = item else {
                self.current = None;
                return Ok(());
            };
            let (key, stored) = item?;
            let (version, payload) = stored.value();
            if let Some(payload) = payload {
                self.current = Some(Entry {
                    key: key.value().to_vec(),
                    version,
                    value: payload.to_vec(),
                });
                return Ok(());
            }
            // Tombstone: keep walking.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn seeded() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Arc::new(AtomicBool::new(true))).unwrap();
        for key in ["ben", "drew", "jason"] {
            store.set(key.as_bytes(), key.as_bytes()).unwrap();
        }
        (dir, store)
    }

    fn collect_keys(iter: &mut Iter) -> Vec<String> {
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next().unwrap();
        }
        keys
    }

    #[test]
    fn forward_iteration_is_key_ordered() {
        let (_dir, store) = seeded();
        let mut iter = store.iter(false).unwrap();
        iter.rewind().unwrap();
        assert_eq!(collect_keys(&mut iter), ["ben", "drew", "jason"]);
    }

    #[test]
    fn reverse_iteration_descends() {
        let (_dir, store) = seeded();
        let mut iter = store.iter(true).unwrap();
        iter.rewind().unwrap();
        assert_eq!(collect_keys(&mut iter), ["jason", "drew", "ben"]);
    }

    #[test]
    fn forward_seek_lands_on_or_after() {
        let (_dir, store) = seeded();
        let mut iter = store.iter(false).unwrap();
        iter.seek(b"c").unwrap();
        assert_eq!(collect_keys(&mut iter), ["drew", "jason"]);
    }

    #[test]
    fn reverse_seek_lands_on_or_before() {
        let (_dir, store) = seeded();
        let mut iter = store.iter(true).unwrap();
        iter.seek(b"ivan").unwrap();
        assert_eq!(collect_keys(&mut iter), ["drew", "ben"]);
    }

    #[test]
    fn tombstones_are_invisible() {
        let (_dir, store) = seeded();
        store.delete(b"drew").unwrap();
        let mut iter = store.iter(false).unwrap();
        iter.rewind().unwrap();
        assert_eq!(collect_keys(&mut iter), ["ben", "jason"]);
    }

    #[test]
    fn snapshots_ignore_later_writes() {
        let (_dir, store) = seeded();
        let mut iter = store.iter(false).unwrap();
        iter.rewind().unwrap();
        store.set(b"aaa", b"late").unwrap();
        assert_eq!(collect_keys(&mut iter), ["ben", "drew", "jason"]);
    }
}
