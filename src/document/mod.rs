//! Documents: opaque, self-describing msgpack payloads.
//!
//! A [`Document`] is the encoded form of whatever the caller stored. It
//! can be decoded back into a typed record, or probed with field-path
//! queries without deserializing the whole payload. Documents read from
//! a key-compressed table carry a handle back to their table so queries
//! and decoding route field names through the dictionary.

pub(crate) mod compress;
pub(crate) mod path;

use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::table::Table;
use crate::value::Value;

/// The encoded value of a record.
#[derive(Debug, Clone)]
pub struct Document {
    data: Vec<u8>,
    table: Option<Table>,
}

impl Document {
    pub(crate) fn new(data: Vec<u8>, table: Option<Table>) -> Document {
        Document { data, table }
    }

    /// Wraps a raw msgpack payload with no owning table.
    pub fn from_bytes(data: Vec<u8>) -> Document {
        Document { data, table: None }
    }

    /// The raw encoded payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the document into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.table {
            Some(table) if table.is_compressed() => {
                let expanded = table.expand_payload(&self.data)?;
                Ok(rmp_serde::from_slice(&expanded)?)
            }
            _ => Ok(rmp_serde::from_slice(&self.data)?),
        }
    }

    /// Returns every value matching a field-path query, in document
    /// order. Malformed payloads and unmatched paths both yield an
    /// empty vector.
    pub fn query_all(&self, query: &str) -> Vec<Value> {
        let resolved;
        let query = match &self.table {
            Some(table) if table.is_compressed() => match resolve_query(table, query) {
                Some(compressed) => {
                    resolved = compressed;
                    resolved.as_str()
                }
                None => return Vec::new(),
            },
            _ => query,
        };

        path::query(&self.data, query).unwrap_or_default()
    }

    /// The first value matching a field-path query.
    pub fn query_one(&self, query: &str) -> Option<Value> {
        self.query_all(query).into_iter().next()
    }

    pub fn query_i64(&self, query: &str) -> i64 {
        self.query_one(query).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    pub fn query_u64(&self, query: &str) -> u64 {
        self.query_one(query).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn query_f64(&self, query: &str) -> f64 {
        self.query_one(query)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }

    pub fn query_str(&self, query: &str) -> String {
        self.query_one(query)
            .and_then(|v| match v {
                Value::Str(s) => Some(s),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn query_bytes(&self, query: &str) -> Vec<u8> {
        self.query_one(query)
            .and_then(|v| match v {
                Value::Bytes(b) => Some(b),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Unix timestamp `(secs, nanos)` at the path, if one is there.
    pub fn query_time(&self, query: &str) -> Option<(i64, u32)> {
        self.query_one(query).and_then(|v| v.as_time())
    }
}

/// Maps the segments of a query through the table's compression
/// dictionary. `*` and numeric segments pass through untouched. A field
/// name the dictionary has never seen cannot match anything, signalled
/// by `None`.
fn resolve_query(table: &Table, query: &str) -> Option<String> {
    let mut out = Vec::new();
    for segment in query.split('.') {
        if segment == "*" || segment.parse::<u32>().is_ok() {
            out.push(segment.to_owned());
            continue;
        }
        out.push(table.lookup_token(segment)?);
    }
    Some(out.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        city: String,
        age: u32,
        height: f64,
        likes: Vec<String>,
    }

    fn jason() -> Person {
        Person {
            name: "Jason".into(),
            city: "Sydney".into(),
            age: 18,
            height: 172.8,
            likes: vec!["go".into(), "js".into()],
        }
    }

    fn doc() -> Document {
        Document::from_bytes(rmp_serde::to_vec_named(&jason()).unwrap())
    }

    #[test]
    fn typed_queries_match_their_kind_and_default_otherwise() {
        let doc = doc();
        assert_eq!(doc.query_str("name"), "Jason");
        assert_eq!(doc.query_str("age"), "");
        assert_eq!(doc.query_i64("age"), 18);
        assert_eq!(doc.query_u64("age"), 18);
        assert_eq!(doc.query_i64("name"), 0);
        assert_eq!(doc.query_f64("height"), 172.8);
        assert_eq!(doc.query_f64("age"), 0.0);
        assert!(doc.query_time("name").is_none());
    }

    #[test]
    fn query_one_returns_the_first_match() {
        let doc = doc();
        assert_eq!(doc.query_one("likes.*"), Some(Value::Str("go".into())));
        assert_eq!(doc.query_one("nothing"), None);
    }

    #[test]
    fn query_all_is_empty_for_unmatched_paths() {
        assert!(doc().query_all("nothing").is_empty());
    }

    #[test]
    fn documents_round_trip_through_decode() {
        let decoded: Person = doc().decode().unwrap();
        assert_eq!(decoded, jason());
    }
}
