//! Canonical JSON encoding and content hashing.
//!
//! Checksums and audit hash-chaining both need a byte representation of a
//! value that is stable regardless of struct field order or `HashMap`
//! iteration order. [`canonicalize`] produces that representation by
//! recursively sorting object keys before serializing; [`digest`] and
//! [`digest_str`] hash the result with `blake3`.

use serde::Serialize;
use serde_json::Value;

/// Recursively sort the keys of every JSON object in `value`.
///
/// Arrays and scalars are returned unchanged; only object key order is
/// normalized, since that is the only source of nondeterminism
/// `serde_json::to_value` can introduce for our record types.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
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

/// Serialize `value` to its canonical JSON string form.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let raw = serde_json::to_value(value)?;
    serde_json::to_string(&canonicalize(&raw))
}

/// blake3 digest (lowercase hex) of a value's canonical JSON encoding.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn digest<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let json = canonical_json(value)?;
    Ok(digest_str(&json))
}

/// blake3 digest (lowercase hex) of raw bytes.
#[must_use]
pub fn digest_str(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

/// Hash chain link: `H(id || timestamp || event_type || canonical(payload) || previous_hash)`.
#[must_use]
pub fn chain_hash(
    id: &str,
    timestamp_rfc3339: &str,
    event_type: &str,
    canonical_payload: &str,
    previous_hash: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(timestamp_rfc3339.as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(canonical_payload.as_bytes());
    hasher.update(previous_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Distinguished `previous_hash` for the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000000000000000";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            serde_json::to_string(&canonicalize(&a)).unwrap(),
            serde_json::to_string(&canonicalize(&b)).unwrap()
        );
    }

    #[test]
    fn digest_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn chain_hash_changes_with_previous() {
        let h1 = chain_hash("e1", "t", "created", "{}", GENESIS_HASH);
        let h2 = chain_hash("e1", "t", "created", "{}", "deadbeef");
        assert_ne!(h1, h2);
    }
}
