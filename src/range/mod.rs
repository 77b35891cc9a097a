//! Streaming ranges: pull-based, buffered, cancellable.
//!
//! Every range-producing call returns a [`Range`]: a producer callback
//! run on a background thread that fills a bounded channel, and a pull
//! side the caller drives with [`Range::next`]. The producer blocks
//! when the buffer is full, the consumer blocks when it is empty.
//!
//! Lifecycle: a range is running until its producer yields a terminal
//! error — [`Error::EndOfRange`](crate::Error::EndOfRange) at
//! exhaustion, anything else on failure — at which point the background
//! thread releases the range's resources *before* publishing the final
//! entry, so storage snapshots are dropped promptly even if the caller
//! never touches the range again. Closing is idempotent (a set-once
//! atomic flag) and happens automatically on drop.
//!
//! Composable operators (`filter`, `skip`, `limit`, `unique`, `count`,
//! `all_into`, `do_each`) live in [`ops`]; each operator range owns its
//! upstream and closes it with itself.

mod ops;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::table::Table;

/// Capacity of the prefetch buffer between a producer and its consumer.
pub(crate) const BUFFER_SIZE: usize = 100;

pub(crate) const DEFAULT_FILTER_WORKERS: usize = 5;
pub(crate) const DEFAULT_DO_WORKERS: usize = 10;

/// Producer callback: yields `(key, payload, counter)` per entry and a
/// terminal error at the end.
pub(crate) type Producer = Box<dyn FnMut() -> Result<(String, Vec<u8>, u64)> + Send>;

/// Runs once when the range closes, releasing producer-side resources.
pub(crate) type Closer = Box<dyn FnOnce() + Send>;

pub(crate) struct RangeEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub counter: u64,
    pub err: Option<Error>,
}

impl RangeEntry {
    pub(crate) fn terminal(err: Error) -> RangeEntry {
        RangeEntry {
            key: String::new(),
            data: Vec::new(),
            counter: 0,
            err: Some(err),
        }
    }
}

/// Close-once state shared between a range, its producer thread, and
/// any downstream operator that needs to cancel it.
pub(crate) struct Shared {
    closed: AtomicBool,
    closer: Mutex<Option<Closer>>,
}

impl Shared {
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(closer) = self.closer.lock().take() {
                closer();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Current {
    key: String,
    data: Vec<u8>,
    counter: u64,
}

/// A pull-based stream of `(key, document, counter)` entries.
pub struct Range {
    rx: Option<Receiver<RangeEntry>>,
    shared: Arc<Shared>,
    current: Option<Current>,
    err: Option<Error>,
    table: Option<Table>,
}

impl Range {
    pub(crate) fn new(producer: Producer, closer: Closer, table: Option<Table>) -> Range {
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            closer: Mutex::new(Some(closer)),
        });
        let (tx, rx) = mpsc::sync_channel(BUFFER_SIZE);
        spawn_producer(producer, tx, shared.clone());
        Range {
            rx: Some(rx),
            shared,
            current: None,
            err: None,
            table,
        }
    }

    /// A range that is already exhausted.
    pub(crate) fn empty() -> Range {
        Range::new(Box::new(|| Err(Error::EndOfRange)), Box::new(|| {}), None)
    }

    /// A range that fails immediately with `err`.
    pub(crate) fn failed(err: Error) -> Range {
        let mut err = Some(err);
        Range::new(
            Box::new(move || Err(err.take().unwrap_or(Error::EndOfRange))),
            Box::new(|| {}),
            None,
        )
    }

    /// Advances to the next entry. Returns `false` at the end of the
    /// stream or on the first error; [`error`](Self::error) then holds
    /// the terminal state.
    pub fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let entry = self.recv();
        match entry.err {
            None => {
                self.current = Some(Current {
                    key: entry.key,
                    data: entry.data,
                    counter: entry.counter,
                });
                true
            }
            Some(err) => {
                self.err = Some(err);
                // The producer thread has already run the closer; this
                // is only bookkeeping for ranges closed mid-buffer.
                self.shared.close();
                false
            }
        }
    }

    /// Primary key of the current entry.
    pub fn key(&self) -> &str {
        self.current.as_ref().map_or("", |c| c.key.as_str())
    }

    /// Version counter of the current entry.
    pub fn counter(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.counter)
    }

    /// The current entry's document.
    pub fn document(&self) -> Document {
        let data = self.current.as_ref().map_or(Vec::new(), |c| c.data.clone());
        Document::new(data, self.table.clone())
    }

    /// Decodes the current entry into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.current.is_none() {
            return Err(Error::NotFound);
        }
        self.document().decode()
    }

    /// The sticky terminal error: `None` while the stream is live,
    /// [`Error::EndOfRange`](crate::Error::EndOfRange) after a normal
    /// end, the producer's error otherwise.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Closes the range, releasing its producer and buffers. Closing an
    /// already-closed range is a no-op.
    pub fn close(&mut self) {
        self.shared.close();
        // Dropping the receiver unblocks a producer stuck on a full
        // buffer.
        self.rx = None;
        if self.err.is_none() {
            self.err = Some(Error::EndOfRange);
        }
    }

    /// Whether the range has been closed, explicitly or by reaching a
    /// terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Pulls the next buffered entry; a disconnected channel reads as
    /// end-of-range. Used by operators that consume their upstream.
    pub(crate) fn recv(&mut self) -> RangeEntry {
        match &self.rx {
            None => RangeEntry::terminal(Error::EndOfRange),
            Some(rx) => match rx.recv() {
                Ok(entry) => entry,
                Err(_) => RangeEntry::terminal(Error::EndOfRange),
            },
        }
    }
}

impl Drop for Range {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn spawn_producer(mut producer: Producer, tx: SyncSender<RangeEntry>, shared: Arc<Shared>) {
    let thread_tx = tx.clone();
    let thread_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name("clowder-range".into())
        .spawn(move || {
            loop {
                if thread_shared.is_closed() {
                    break;
                }
                match producer() {
                    Ok((key, data, counter)) => {
                        let entry = RangeEntry {
                            key,
                            data,
                            counter,
                            err: None,
                        };
                        if thread_tx.send(entry).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // Release the producer's resources before the
                        // consumer can observe the terminal entry.
                        thread_shared.close();
                        let _ = thread_tx.send(RangeEntry::terminal(err));
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        shared.close();
        let _ = tx.send(RangeEntry::terminal(Error::Io(err)));
    }
}
