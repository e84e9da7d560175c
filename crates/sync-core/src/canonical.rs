//! Canonical JSON encoding used for every signed message in the protocol.
//!
//! Signature verification depends on both sides reproducing byte-identical
//! output for the same logical object: keys are sorted lexicographically at
//! every nesting depth and no insignificant whitespace is emitted. A
//! "pretty" or insertion-order encoder will not interoperate.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Serialize `value` to its canonical JSON byte representation.
///
/// This is the normative encoding for all signing and hashing of structured
/// messages (beacons, challenge responses, ...).
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = serde_json::to_value(value).map_err(Error::from)?;
    Ok(canonicalize_value(&raw).into_bytes())
}

/// Same as [`canonical_bytes`] but returns a `String`.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value).map_err(Error::from)?;
    Ok(canonicalize_value(&raw))
}

/// Recursively re-order object keys and render without whitespace.
fn canonicalize_value(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = String::from("{");
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string key always serializes"));
                out.push(':');
                out.push_str(&canonicalize_value(v));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonicalize_value(item));
            }
            out.push(']');
            out
        }
        // Strings, numbers, bools, and null already round-trip without
        // insignificant whitespace via serde_json's compact writer.
        other => serde_json::to_string(other).expect("scalar JSON values always serialize"),
    }
}
