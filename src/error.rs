//! Error taxonomy exported by the crate.
//!
//! The first six variants are sentinel outcomes callers are expected to
//! match on: `update` retries on [`Error::CounterChanged`], range
//! consumers treat [`Error::EndOfRange`] as the normal terminal, and
//! `one()` maps an empty range to [`Error::NotFound`]. The remaining
//! variants pass through failures from the storage engine, the document
//! codec and the filesystem.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A table or index with the same name is already registered.
    #[error("already exists")]
    AlreadyExists,

    /// The key, table or index does not exist.
    #[error("not found")]
    NotFound,

    /// An identifier was empty or longer than 125 bytes.
    #[error("bad identifier")]
    BadIdentifier,

    /// Normal terminal state of a range.
    #[error("end of range")]
    EndOfRange,

    /// A conditional write observed a different version counter.
    #[error("counter changed")]
    CounterChanged,

    /// A secondary index entry was malformed or inconsistent.
    #[error("index error")]
    IndexError,

    /// Failure surfaced by the storage engine.
    #[error(transparent)]
    Storage(#[from] redb::Error),

    /// Failure while encoding or decoding a document payload.
    #[error("codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Caller-supplied error, surfaced verbatim from `update` handlers
    /// and range operators.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Wraps an arbitrary message, for use inside `update` handlers and
    /// `filter`/`do_each` callbacks.
    pub fn msg(message: impl Into<String>) -> Error {
        Error::Msg(message.into())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Error {
        Error::Storage(err.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Error {
        Error::Storage(err.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Error {
        Error::Storage(err.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Error {
        Error::Storage(err.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Error {
        Error::Storage(err.into())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Error {
        Error::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Error {
        Error::Codec(err.to_string())
    }
}

impl From<rmpv::decode::Error> for Error {
    fn from(err: rmpv::decode::Error) -> Error {
        Error::Codec(err.to_string())
    }
}

impl From<rmpv::encode::Error> for Error {
    fn from(err: rmpv::encode::Error) -> Error {
        Error::Codec(err.to_string())
    }
}
