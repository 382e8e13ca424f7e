use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic fingerprint of a JSON value: recursively sorts mapping keys
/// before hashing, so equal logical values hash equal regardless of the
/// object-key order they arrived in.
pub fn canonical_fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonicalized value always serializes");
    format!("{:x}", Sha256::digest(&bytes))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_fingerprint() {
        let a = json!({"from": "x", "to": "y", "amount": 10});
        let b = json!({"amount": 10, "to": "y", "from": "x"});
        assert_eq!(canonical_fingerprint(&a), canonical_fingerprint(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({"amount": 10});
        let b = json!({"amount": 11});
        assert_ne!(canonical_fingerprint(&a), canonical_fingerprint(&b));
    }

    #[test]
    fn nested_objects_are_canonicalized_recursively() {
        let a = json!({"outer": {"b": 1, "a": 2}});
        let b = json!({"outer": {"a": 2, "b": 1}});
        assert_eq!(canonical_fingerprint(&a), canonical_fingerprint(&b));
    }

    #[test]
    fn output_is_hex_encoded_sha256() {
        let fp = canonical_fingerprint(&json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
