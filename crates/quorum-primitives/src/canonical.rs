//! canonical json
//!
//! object keys sorted bytewise at every depth, no insignificant whitespace.
//! signatures are computed over these bytes, so two implementations that agree
//! on the payload value also agree on the digest.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// serialize `value` to canonical json bytes
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::Encoding(e.to_string()))?;
    serde_json::to_vec(&sort_keys(value)).map_err(|e| Error::Encoding(e.to_string()))
}

/// canonical json as a string
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let bytes = to_canonical_json(value)?;
    String::from_utf8(bytes).map_err(|e| Error::Encoding(e.to_string()))
}

// serde_json keeps insertion order when `preserve_order` is enabled anywhere in
// the dependency graph, so ordering is rebuilt explicitly
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
