//! Deterministic ("canonical") JSON serialization.
//!
//! The log's hash chain (spec §3) is defined over
//! `SHA-256(seq ‖ prev_hash ‖ canonical_json(data))`. `serde_json::Value`
//! already sorts object keys when the `preserve_order` feature is absent,
//! which is the default in this workspace, so canonicalization here is
//! just "serialize with no extraneous whitespace" — but we make that
//! explicit and in one place so every caller hashes the exact same bytes.

use serde_json::Value;

/// Serialize `value` to its canonical byte representation.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    // `serde_json::to_vec` produces compact, deterministic output for a
    // `Value` whose maps are `BTreeMap`-backed (the crate default).
    serde_json::to_vec(value).expect("serde_json::Value serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_is_deterministic() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json_bytes(&a), canonical_json_bytes(&b));
    }
}
