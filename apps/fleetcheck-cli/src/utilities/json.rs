//! Canonicalization of finding data trees.
//!
//! Persisted finding payloads must be rooted trees of null, booleans,
//! numbers, strings, sequences, and string-keyed maps. Database drivers
//! hand back values that do not fit that alphabet (non-finite floats,
//! arbitrary-precision decimals, native timestamps); everything is folded
//! into it here, in one place, before serialization.

use serde_json::{Map, Value};

/// Returns a copy of the value with every non-finite number replaced by
/// null. Nested sequences and maps are canonicalized recursively; key
/// insertion order is preserved.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

/// Converts an f64 into a JSON number, mapping NaN/infinity to null.
pub fn number_or_null(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Reads a numeric leaf out of a data tree by key path. Accepts integers
/// and floats; anything else yields None.
pub fn numeric_at_path<'a>(root: &'a Value, path: &[&str]) -> Option<f64> {
    let mut cursor = root;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_replaces_non_finite() {
        let v = json!({"a": 1.5, "b": [1, 2]});
        assert_eq!(canonicalize(&v), v, "finite trees pass through unchanged");

        assert_eq!(number_or_null(f64::NAN), Value::Null);
        assert_eq!(number_or_null(f64::INFINITY), Value::Null);
        assert_eq!(number_or_null(2.0), json!(2.0));
    }

    #[test]
    fn test_canonicalize_preserves_key_order() {
        let v = json!({"z": 1, "a": 2, "m": {"y": 1, "b": 2}});
        let out = canonicalize(&v);
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a", "m"], "insertion order is significant");
    }

    #[test]
    fn test_numeric_at_path() {
        let v = json!({"cluster": {"total_urp": 5, "name": "x"}});
        assert_eq!(numeric_at_path(&v, &["cluster", "total_urp"]), Some(5.0));
        assert_eq!(numeric_at_path(&v, &["cluster", "name"]), None);
        assert_eq!(numeric_at_path(&v, &["missing"]), None);
    }
}
