//! Deterministic byte encoding of structured values.
//!
//! Object keys are sorted lexicographically, arrays preserve insertion
//! order, and separators carry no insignificant whitespace: `,` between
//! elements, `:` between key and value, never a space. Two semantically
//! equal objects with differently ordered keys canonicalize to identical
//! bytes; this is the property every hash in the workspace depends on.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::EncodingError;

/// Canonicalize a JSON value into its deterministic byte encoding.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// Canonicalize a flat object, the common case of a receipt's payload fields.
pub fn canonicalize_map(map: &Map<String, Value>) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::new();
    write_object(map.iter(), &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodingError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map.iter(), out)?,
    }
    Ok(())
}

fn write_object<'a>(
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
    out: &mut Vec<u8>,
) -> Result<(), EncodingError> {
    let sorted: BTreeMap<&String, &Value> = entries.collect();
    out.push(b'{');
    for (i, (k, v)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_string(k, out)?;
        out.push(b':');
        write_value(v, out)?;
    }
    out.push(b'}');
    Ok(())
}

fn write_number(n: &serde_json::Number, out: &mut Vec<u8>) -> Result<(), EncodingError> {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(EncodingError::NonFiniteNumber);
        }
        // Rust's default f64 Display is a shortest round-trippable decimal,
        // the deterministic textual form this workspace standardizes on.
        out.extend_from_slice(format!("{f}").as_bytes());
    } else {
        return Err(EncodingError::UnrepresentableNumber);
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), EncodingError> {
    // serde_json's string serializer already produces a correctly escaped,
    // quoted UTF-8 string; reuse it instead of hand-rolling escape rules.
    let encoded = serde_json::to_string(s).map_err(|_| EncodingError::InvalidUtf8)?;
    out.extend_from_slice(encoded.as_bytes());
    Ok(())
}

/// Validate raw bytes as UTF-8 and pass them through unchanged, for payloads
/// that arrive as pre-serialized bytes rather than structured JSON.
pub fn canonicalize_raw_bytes(bytes: &[u8]) -> Result<Vec<u8>, EncodingError> {
    std::str::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_output() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(canonicalize(&a).unwrap(), br#"{"a":1,"b":2}"#.to_vec());
    }

    #[test]
    fn arrays_preserve_order() {
        let a = json!([3, 1, 2]);
        assert_eq!(canonicalize(&a).unwrap(), b"[3,1,2]".to_vec());
    }

    #[test]
    fn nested_objects_sort_at_every_level() {
        let v = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(
            canonicalize(&v).unwrap(),
            br#"{"a":1,"z":{"x":2,"y":1}}"#.to_vec()
        );
    }

    #[test]
    fn nulls_and_bools_use_fixed_tokens() {
        assert_eq!(canonicalize(&json!(null)).unwrap(), b"null".to_vec());
        assert_eq!(canonicalize(&json!(true)).unwrap(), b"true".to_vec());
        assert_eq!(canonicalize(&json!(false)).unwrap(), b"false".to_vec());
    }

    proptest::proptest! {
        #[test]
        fn canonicalization_is_deterministic_for_any_object(
            keys in proptest::collection::vec("[a-z]{1,6}", 1..8),
            vals in proptest::collection::vec(-1000i64..1000, 1..8),
        ) {
            let mut map = Map::new();
            for (k, v) in keys.into_iter().zip(vals) {
                map.insert(k, json!(v));
            }
            let once = canonicalize_map(&map).unwrap();
            let twice = canonicalize_map(&map).unwrap();
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
