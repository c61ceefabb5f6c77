//! Deterministic fingerprints for cache keys and change detection.
//!
//! A fingerprint is the truncated lowercase-hex SHA-256 of a
//! canonicalized value. The same logical value always fingerprints the
//! same way, across processes and restarts; that property is what lets
//! fingerprints appear in on-disk cache paths and etags.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex length of a fingerprint. 64 bits is plenty for cache keying.
const FINGERPRINT_LEN: usize = 16;

/// Full SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a byte sequence.
pub fn fingerprint(data: impl AsRef<[u8]>) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Fingerprint of several parts joined with an unambiguous separator.
///
/// Each part is length-prefixed so that `["ab","c"]` and `["a","bc"]`
/// hash differently.
pub fn fingerprint_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Fingerprint of a serializable value via its canonical JSON form.
///
/// `serde_json` orders object keys lexicographically, which makes the
/// serialization canonical for values that round-trip through
/// `serde_json::Value`.
pub fn fingerprint_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    Ok(fingerprint(serde_json::to_string(&canonical)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_across_calls() {
        assert_eq!(fingerprint("hello"), fingerprint("hello"));
        assert_ne!(fingerprint("hello"), fingerprint("world"));
        assert_eq!(fingerprint("hello").len(), FINGERPRINT_LEN);
    }

    #[test]
    fn parts_are_length_prefixed() {
        assert_ne!(
            fingerprint_parts(["ab", "c"]),
            fingerprint_parts(["a", "bc"])
        );
        assert_eq!(
            fingerprint_parts(["a", "b"]),
            fingerprint_parts(["a", "b"])
        );
    }

    #[test]
    fn json_key_order_is_canonical() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            fingerprint_json(&a).unwrap(),
            fingerprint_json(&b).unwrap()
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
