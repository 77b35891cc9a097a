//! Byte-comparable encodings.
//!
//! Sort keys produced here are compared with a plain `memcmp`; no type
//! information survives into the encoded form. See [`key`] for the
//! per-type contracts.

pub(crate) mod key;

pub(crate) use key::sort_key;
