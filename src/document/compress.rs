//! Transparent key compression for stored documents.
//!
//! Field names repeat in every stored document, so a table can opt into
//! a grow-only dictionary mapping each field name to a short token. The
//! dictionary only ever grows, tokens are never reused, and every growth
//! is persisted into the database configuration before the write that
//! triggered it proceeds.

use std::collections::HashMap;

use rmpv::Value as MpValue;

use crate::error::Result;

/// Grow-only two-way mapping between field names and tokens.
#[derive(Debug)]
pub(crate) struct Dictionary {
    key_to_token: HashMap<String, String>,
    token_to_key: HashMap<String, String>,
    next_token: String,
}

impl Dictionary {
    pub(crate) fn new() -> Dictionary {
        Dictionary {
            key_to_token: HashMap::new(),
            token_to_key: HashMap::new(),
            next_token: "0".to_owned(),
        }
    }

    /// Rebuilds the dictionary from its persisted form.
    pub(crate) fn from_saved(key_to_token: HashMap<String, String>, next_token: String) -> Dictionary {
        let token_to_key = key_to_token
            .iter()
            .map(|(key, token)| (token.clone(), key.clone()))
            .collect();
        let next_token = if next_token.is_empty() {
            "0".to_owned()
        } else {
            next_token
        };
        Dictionary {
            key_to_token,
            token_to_key,
            next_token,
        }
    }

    pub(crate) fn token(&self, key: &str) -> Option<&str> {
        self.key_to_token.get(key).map(String::as_str)
    }

    pub(crate) fn key_for(&self, token: &str) -> Option<&str> {
        self.token_to_key.get(token).map(String::as_str)
    }

    /// Assigns the next token to `key` and advances the sequence.
    pub(crate) fn assign(&mut self, key: &str) -> String {
        let token = self.next_token.clone();
        self.key_to_token.insert(key.to_owned(), token.clone());
        self.token_to_key.insert(token.clone(), key.to_owned());
        self.next_token = increment_token(&token);
        token
    }

    /// Undoes an [`assign`](Self::assign) whose persistence failed.
    pub(crate) fn unassign(&mut self, key: &str, token: &str) {
        self.key_to_token.remove(key);
        self.token_to_key.remove(token);
        self.next_token = token.to_owned();
    }

    /// The persisted representation: forward map plus next token.
    pub(crate) fn snapshot(&self) -> (HashMap<String, String>, String) {
        (self.key_to_token.clone(), self.next_token.clone())
    }
}

/// Advances a token through the printable ASCII range `'0'..='~'`,
/// little-endian with carry; a full carry appends another character.
pub(crate) fn increment_token(token: &str) -> String {
    let mut bytes = token.as_bytes().to_vec();
    for byte in bytes.iter_mut() {
        if *byte < b'~' {
            *byte += 1;
            return String::from_utf8(bytes).expect("token stays ascii");
        }
        *byte = b'0';
    }
    bytes.push(b'0');
    String::from_utf8(bytes).expect("token stays ascii")
}

/// Rewrites every string map key in the tree through `map`.
pub(crate) fn compress_tree(
    value: MpValue,
    map: &mut impl FnMut(&str) -> Result<String>,
) -> Result<MpValue> {
    Ok(match value {
        MpValue::Map(pairs) => {
            let mut rewritten = Vec::with_capacity(pairs.len());
            for (key, inner) in pairs {
                let key = match key.as_str() {
                    Some(name) => MpValue::from(map(name)?.as_str()),
                    None => key,
                };
                rewritten.push((key, compress_tree(inner, map)?));
            }
            MpValue::Map(rewritten)
        }
        MpValue::Array(items) => MpValue::Array(
            items
                .into_iter()
                .map(|item| compress_tree(item, map))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other,
    })
}

/// Inverse of [`compress_tree`]; `map` must be total (unknown tokens map
/// to themselves at the caller).
pub(crate) fn expand_tree(value: MpValue, map: &mut impl FnMut(&str) -> String) -> MpValue {
    match value {
        MpValue::Map(pairs) => MpValue::Map(
            pairs
                .into_iter()
                .map(|(key, inner)| {
                    let key = match key.as_str() {
                        Some(token) => MpValue::from(map(token).as_str()),
                        None => key,
                    };
                    (key, expand_tree(inner, map))
                })
                .collect(),
        ),
        MpValue::Array(items) => MpValue::Array(
            items
                .into_iter()
                .map(|item| expand_tree(item, map))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_advance_through_the_printable_range() {
        assert_eq!(increment_token("0"), "1");
        assert_eq!(increment_token("9"), ":");
        assert_eq!(increment_token("a"), "b");
        assert_eq!(increment_token("}"), "~");
        assert_eq!(increment_token("~"), "00");
        assert_eq!(increment_token("~~"), "000");
        assert_eq!(increment_token("~0"), "01");
    }

    #[test]
    fn assign_and_rollback_round_trip() {
        let mut dict = Dictionary::new();
        let token = dict.assign("Name");
        assert_eq!(token, "0");
        assert_eq!(dict.token("Name"), Some("0"));
        assert_eq!(dict.key_for("0"), Some("Name"));
        assert_eq!(dict.assign("Age"), "1");

        dict.unassign("Age", "1");
        assert_eq!(dict.token("Age"), None);
        assert_eq!(dict.assign("City"), "1");
    }

    #[test]
    fn saved_dictionaries_rebuild_the_reverse_map() {
        let mut dict = Dictionary::new();
        dict.assign("Name");
        dict.assign("Age");
        let (saved, next) = dict.snapshot();

        let restored = Dictionary::from_saved(saved, next);
        assert_eq!(restored.key_for("0"), Some("Name"));
        assert_eq!(restored.key_for("1"), Some("Age"));
        assert_eq!(restored.token("Age"), Some("1"));
    }

    #[test]
    fn trees_compress_and_expand_losslessly() {
        let mut dict = Dictionary::new();
        let doc = MpValue::Map(vec![
            (
                MpValue::from("Name"),
                MpValue::from("Jason"),
            ),
            (
                MpValue::from("Nested"),
                MpValue::Map(vec![(MpValue::from("Age"), MpValue::from(18))]),
            ),
        ]);

        let compressed = compress_tree(doc.clone(), &mut |key| {
            Ok(match dict.token(key) {
                Some(token) => token.to_owned(),
                None => dict.assign(key),
            })
        })
        .unwrap();

        let MpValue::Map(ref pairs) = compressed else {
            panic!("expected map");
        };
        assert_eq!(pairs[0].0.as_str(), Some("0"));

        let expanded = expand_tree(compressed, &mut |token| {
            dict.key_for(token).unwrap_or(token).to_owned()
        });
        assert_eq!(expanded, doc);
    }
}
