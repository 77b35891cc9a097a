//! Composable operators over ranges.
//!
//! Every operator consumes its upstream range and returns a new one
//! that owns it: closing the downstream closes the whole chain. The
//! parallel operators (`filter`, `do_each`) run fixed worker pools;
//! `filter` preserves upstream order by dispatching and collecting in
//! the same round-robin cycle, `do_each` makes no ordering promise.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::range::{Range, RangeEntry, DEFAULT_DO_WORKERS, DEFAULT_FILTER_WORKERS};

struct FilterMsg {
    entry: RangeEntry,
    keep: bool,
}

impl Range {
    /// Keeps only entries for which `predicate` returns `true`,
    /// evaluated by a pool of [`DEFAULT_FILTER_WORKERS`] workers.
    pub fn filter<F>(self, predicate: F) -> Range
    where
        F: Fn(&Document) -> Result<bool> + Send + Sync + 'static,
    {
        self.filter_with(predicate, DEFAULT_FILTER_WORKERS)
    }

    /// [`filter`](Self::filter) with an explicit worker count. Surviving
    /// entries keep their upstream order regardless of worker count; a
    /// predicate error terminates the stream with that error.
    pub fn filter_with<F>(mut self, predicate: F, workers: usize) -> Range
    where
        F: Fn(&Document) -> Result<bool> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let table = self.table().cloned();
        let upstream = self.shared();
        let predicate = Arc::new(predicate);

        let mut inboxes: Vec<SyncSender<RangeEntry>> = Vec::with_capacity(workers);
        let mut outboxes: Vec<Receiver<FilterMsg>> = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (in_tx, in_rx) = mpsc::sync_channel::<RangeEntry>(1);
            let (out_tx, out_rx) = mpsc::sync_channel::<FilterMsg>(1);
            inboxes.push(in_tx);
            outboxes.push(out_rx);

            let predicate = predicate.clone();
            let table = table.clone();
            spawn_pool_thread("clowder-filter", move || {
                while let Ok(entry) = in_rx.recv() {
                    if entry.err.is_some() {
                        let _ = out_tx.send(FilterMsg { entry, keep: false });
                        return;
                    }
                    let doc = Document::new(entry.data.clone(), table.clone());
                    let msg = match predicate(&doc) {
                        Ok(keep) => FilterMsg { entry, keep },
                        // The error travels as a sentinel entry so the
                        // collector sees it in dispatch position.
                        Err(err) => FilterMsg {
                            entry: RangeEntry::terminal(err),
                            keep: false,
                        },
                    };
                    let terminal = msg.entry.err.is_some();
                    if out_tx.send(msg).is_err() || terminal {
                        return;
                    }
                }
            });
        }

        // Dispatcher: round-robin entries (and finally the terminal)
        // across worker inboxes in a fixed cycle.
        spawn_pool_thread("clowder-filter", move || {
            let mut slot = 0;
            loop {
                let entry = self.recv();
                let terminal = entry.err.is_some();
                if inboxes[slot].send(entry).is_err() {
                    return;
                }
                slot = (slot + 1) % inboxes.len();
                if terminal {
                    return;
                }
            }
        });

        // Collector: read outboxes in the same cycle, so survivors come
        // out in exactly the order the dispatcher saw them.
        let mut slot = 0;
        let collector_table = table.clone();
        Range::new(
            Box::new(move || loop {
                let msg = match outboxes[slot].recv() {
                    Ok(msg) => msg,
                    Err(_) => return Err(Error::EndOfRange),
                };
                slot = (slot + 1) % outboxes.len();
                if let Some(err) = msg.entry.err {
                    return Err(err);
                }
                if msg.keep {
                    return Ok((msg.entry.key, msg.entry.data, msg.entry.counter));
                }
            }),
            Box::new(move || upstream.close()),
            collector_table,
        )
    }

    /// Drops up to `n` entries, then yields the rest.
    pub fn skip(mut self, n: usize) -> Range {
        let table = self.table().cloned();
        let upstream = self.shared();
        let mut remaining = n;
        Range::new(
            Box::new(move || {
                while remaining > 0 {
                    remaining -= 1;
                    let entry = self.recv();
                    if let Some(err) = entry.err {
                        return Err(err);
                    }
                }
                entry_result(self.recv())
            }),
            Box::new(move || upstream.close()),
            table,
        )
    }

    /// Ends the stream after `n` entries.
    pub fn limit(mut self, n: usize) -> Range {
        let table = self.table().cloned();
        let upstream = self.shared();
        let mut remaining = n;
        Range::new(
            Box::new(move || {
                if remaining == 0 {
                    return Err(Error::EndOfRange);
                }
                remaining -= 1;
                entry_result(self.recv())
            }),
            Box::new(move || upstream.close()),
            table,
        )
    }

    /// Yields each primary key at most once, preserving first-seen
    /// order. Memory grows with the number of distinct keys.
    pub fn unique(mut self) -> Range {
        let table = self.table().cloned();
        let upstream = self.shared();
        let mut seen = hashbrown::HashSet::new();
        Range::new(
            Box::new(move || loop {
                let entry = self.recv();
                if let Some(err) = entry.err {
                    return Err(err);
                }
                if seen.insert(entry.key.clone()) {
                    return Ok((entry.key, entry.data, entry.counter));
                }
            }),
            Box::new(move || upstream.close()),
            table,
        )
    }

    /// Drains the stream, counting entries. A normal end returns the
    /// count with no error; any other terminal error is returned
    /// alongside the count reached so far.
    pub fn count(mut self) -> (u64, Option<Error>) {
        let mut total = 0;
        loop {
            let entry = self.recv();
            match entry.err {
                None => total += 1,
                Some(Error::EndOfRange) => return (total, None),
                Some(err) => return (total, Some(err)),
            }
        }
    }

    /// Drains the stream, decoding every entry into `out`. Entries
    /// decoded before an error stay in `out`.
    pub fn all_into<T: DeserializeOwned>(mut self, out: &mut Vec<T>) -> Result<()> {
        while self.next() {
            out.push(self.decode()?);
        }
        match self.err.take() {
            None | Some(Error::EndOfRange) => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Runs `action` over every entry on [`DEFAULT_DO_WORKERS`] workers.
    pub fn do_each<F>(self, action: F) -> Result<()>
    where
        F: Fn(&str, u64, Document) -> Result<()> + Send + Sync + 'static,
    {
        self.do_each_with(action, DEFAULT_DO_WORKERS)
    }

    /// [`do_each`](Self::do_each) with an explicit worker count.
    /// Processing order is unspecified. Returns the first error from
    /// `action` or from the stream, after all workers have finished;
    /// the range is closed on every path out.
    pub fn do_each_with<F>(mut self, action: F, workers: usize) -> Result<()>
    where
        F: Fn(&str, u64, Document) -> Result<()> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let table = self.table().cloned();
        let action = Arc::new(action);
        let first_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let (tx, rx) = mpsc::sync_channel::<RangeEntry>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let action = action.clone();
            let table = table.clone();
            let first_err = first_err.clone();
            let first_err_spawn_err = first_err.clone();
            let handle = thread::Builder::new()
                .name("clowder-do".into())
                .spawn(move || loop {
                    let entry = {
                        let guard = rx.lock();
                        guard.recv()
                    };
                    let Ok(entry) = entry else {
                        return;
                    };
                    // Keep draining after a failure so the dispatcher
                    // never wedges on a full channel; the action itself
                    // is no longer invoked.
                    if first_err.lock().is_some() {
                        continue;
                    }
                    let doc = Document::new(entry.data, table.clone());
                    if let Err(err) = action(&entry.key, entry.counter, doc) {
                        let mut slot = first_err.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let mut slot = first_err_spawn_err.lock();
                    if slot.is_none() {
                        *slot = Some(Error::Io(err));
                    }
                    break;
                }
            }
        }

        let mut stream_err = None;
        loop {
            if first_err.lock().is_some() {
                break;
            }
            let entry = self.recv();
            match entry.err {
                Some(Error::EndOfRange) => break,
                Some(err) => {
                    stream_err = Some(err);
                    break;
                }
                None => {
                    if tx.send(entry).is_err() {
                        break;
                    }
                }
            }
        }

        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
        self.close();

        let taken = first_err.lock().take();
        match taken.or(stream_err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn entry_result(entry: RangeEntry) -> Result<(String, Vec<u8>, u64)> {
    match entry.err {
        Some(err) => Err(err),
        None => Ok((entry.key, entry.data, entry.counter)),
    }
}

fn spawn_pool_thread(name: &str, body: impl FnOnce() + Send + 'static) {
    let _ = thread::Builder::new().name(name.into()).spawn(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn keyed_range(keys: &[&str]) -> Range {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        let mut at = 0;
        Range::new(
            Box::new(move || {
                if at == keys.len() {
                    return Err(Error::EndOfRange);
                }
                at += 1;
                Ok((keys[at - 1].clone(), Vec::new(), at as u64))
            }),
            Box::new(|| {}),
            None,
        )
    }

    fn drain(mut range: Range) -> Vec<String> {
        let mut keys = Vec::new();
        while range.next() {
            keys.push(range.key().to_owned());
        }
        keys
    }

    #[test]
    fn skip_drops_a_prefix() {
        assert_eq!(drain(keyed_range(&["a", "b", "c"]).skip(1)), ["b", "c"]);
        assert_eq!(drain(keyed_range(&["a", "b", "c"]).skip(3)), Vec::<String>::new());
        assert_eq!(drain(keyed_range(&["a", "b"]).skip(5)), Vec::<String>::new());
    }

    #[test]
    fn limit_truncates() {
        assert_eq!(drain(keyed_range(&["a", "b", "c"]).limit(2)), ["a", "b"]);
        assert_eq!(drain(keyed_range(&["a"]).limit(5)), ["a"]);
        let mut limited = keyed_range(&["a", "b"]).limit(0);
        assert!(!limited.next());
        assert!(matches!(limited.error(), Some(Error::EndOfRange)));
    }

    #[test]
    fn unique_preserves_first_seen_order() {
        let range = keyed_range(&["b", "a", "b", "c", "a"]);
        assert_eq!(drain(range.unique()), ["b", "a", "c"]);
    }

    #[test]
    fn count_drains_and_reports_errors_alongside() {
        let (n, err) = keyed_range(&["a", "b", "c"]).count();
        assert_eq!(n, 3);
        assert!(err.is_none());

        let mut yielded = false;
        let broken = Range::new(
            Box::new(move || {
                if yielded {
                    return Err(Error::msg("broken"));
                }
                yielded = true;
                Ok((String::from("a"), Vec::new(), 1))
            }),
            Box::new(|| {}),
            None,
        );
        let (n, err) = broken.count();
        assert_eq!(n, 1);
        assert!(matches!(err, Some(Error::Msg(_))));
    }

    #[test]
    fn do_each_visits_everything_and_propagates_the_first_error() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        keyed_range(&["a", "b", "c"])
            .do_each_with(
                move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                4,
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let err = keyed_range(&["a", "b"])
            .do_each(|key, _, _| {
                if key == "b" {
                    Err(Error::msg("stop"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Msg(_)));
    }

    #[test]
    fn do_each_surfaces_stream_errors() {
        let broken = Range::failed(Error::msg("upstream"));
        let err = broken.do_each(|_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Msg(_)));
    }

    #[test]
    fn filter_preserves_order_across_workers() {
        #[derive(serde::Serialize)]
        struct Row {
            n: u64,
        }

        let mut at = 0u64;
        let range = Range::new(
            Box::new(move || {
                if at == 20 {
                    return Err(Error::EndOfRange);
                }
                at += 1;
                let data = rmp_serde::to_vec_named(&Row { n: at }).unwrap();
                Ok((format!("k{at:02}"), data, at))
            }),
            Box::new(|| {}),
            None,
        );

        let filtered = range.filter_with(|doc| Ok(doc.query_u64("n") % 2 == 0), 3);
        let expected: Vec<String> = (1..=20u64)
            .filter(|n| n % 2 == 0)
            .map(|n| format!("k{n:02}"))
            .collect();
        assert_eq!(drain(filtered), expected);
    }

    #[test]
    fn filter_predicate_errors_terminate_the_stream() {
        let mut filtered = keyed_range(&["a", "b"]).filter(|_| Err(Error::msg("bad predicate")));
        assert!(!filtered.next());
        assert!(matches!(filtered.error(), Some(Error::Msg(_))));
        assert!(filtered.is_closed());
    }

    #[test]
    fn operators_chain() {
        let range = keyed_range(&["a", "b", "b", "c", "d"]);
        assert_eq!(drain(range.unique().skip(1).limit(2)), ["b", "c"]);
    }
}
