use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_str(s: &str) -> String {
    sha256_bytes(s.as_bytes())
}

/// Serializes `value` with object keys in sorted order.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled, so
/// routing through `Value` is enough to make the encoding stable.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value: Value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// SHA-256 over the canonical JSON encoding of `value`.
pub fn canonical_json_digest(value: &Value) -> String {
    // Encoding an in-memory Value cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_str("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"beta": 0.3, "gamma": {"y": 1, "x": 2}});
        let b = json!({"gamma": {"x": 2, "y": 1}, "beta": 0.3});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert_ne!(
            canonical_json_digest(&a),
            canonical_json_digest(&json!({"beta": 0.4}))
        );
    }

    #[test]
    fn canonical_bytes_sort_struct_maps() {
        let mut map = std::collections::HashMap::new();
        map.insert("z", 1);
        map.insert("a", 2);
        let bytes = canonical_json_bytes(&map).expect("encode");
        assert_eq!(String::from_utf8(bytes).expect("utf8"), r#"{"a":2,"z":1}"#);
    }
}
