//! # clowder - embedded document database
//!
//! Clowder stores schemaless, msgpack-encoded documents under string
//! primary keys and keeps declaratively-defined secondary indexes in
//! step with every write. It is a single-process library: no server, no
//! wire protocol, no query language beyond field paths and range
//! predicates.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │        Database (registry, config)        │
//! ├─────────────────────┬─────────────────────┤
//! │   Table (CRUD,      │  Index (point/range │
//! │   optimistic CAS)   │  lookups, backfill) │
//! ├─────────────────────┴─────────────────────┤
//! │   Range engine (producer threads, bounded │
//! │   buffers, composable operators)          │
//! ├───────────────────────────────────────────┤
//! │   Document codec (msgpack, field paths,   │
//! │   key compression) │ Sort-key encoding    │
//! ├───────────────────────────────────────────┤
//! │   Storage (redb: versioned entries, CAS,  │
//! │   snapshot iterators, background GC)      │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use clowder::Database;
//!
//! let db = Database::open("./people-db")?;
//! let people = db.new_table("people")?;
//! people.set("jason", &Person { name: "Jason".into(), age: 18 })?;
//!
//! people.new_index("age")?;
//! let mut adults = people.index("age").unwrap().between(18, 200, false);
//! while adults.next() {
//!     println!("{}", adults.key());
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Writes are optimistic: every record carries a version counter and
//! conditional writes compare against it ([`Table::update`] packages
//! the retry loop). Ranges prefetch on a background thread into a
//! bounded buffer and are closed idempotently, on drop at the latest.
//! Index maintenance is read-modify-CAS per entry and never rolls back
//! the primary write; indexes self-heal on later reads.
//!
//! ## On-disk layout
//!
//! One directory per database: `config.dat` (msgpack configuration),
//! plus a subdirectory per table - named by the hex of the table name -
//! holding the primary namespace under `data/` and one subdirectory per
//! index.

mod config;
mod database;
mod document;
mod encoding;
mod error;
mod index;
mod range;
mod storage;
mod table;
mod value;

pub use database::Database;
pub use document::Document;
pub use error::{Error, Result};
pub use index::Index;
pub use range::Range;
pub use table::Table;
pub use value::{Bound, Value};
