//! broker_common
//!
//! Canonical JSON serialization + SHA-256 hashing utilities shared by every
//! component that needs deterministic hashes: the audit hash chain, vault
//! storage keys, attachment refs, session token payloads.
//!
//! IMPORTANT: Do not "pretty print". Hashes are computed over canonical
//! bytes (sorted object keys, no whitespace).

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to canonical JSON bytes: stable key ordering, no whitespace, UTF-8.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Return "sha256:<hex>" of canonical JSON bytes.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_bytes(&bytes))
}

/// Return "sha256:<hex>" of raw bytes.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("sha256:{}", hex::encode(digest))
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Constant-time byte comparison. Used anywhere a secret is compared against
/// attacker-controlled input (session tokens, proxy tokens, HMAC tags) so
/// that timing does not leak how many leading bytes matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        // Still perform a dummy comparison of equal-length data so that the
        // length check itself doesn't dominate observable timing for the
        // common case of near-equal-length inputs.
        let probe_len = a.len().min(b.len());
        let _ = a[..probe_len].ct_eq(&b[..probe_len]);
        return false;
    }
    a.ct_eq(b).into()
}

/// Milliseconds since the Unix epoch, used for filenames and coarse timestamps.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the Unix epoch as a float, matching the `ts: f64` fields
/// used throughout the audit event schema.
pub fn now_unix_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Random lowercase hex string of `len` hex digits (`len/2` bytes), used for
/// attachment filenames and other unguessable-but-not-secret identifiers.
pub fn random_hex(len: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(len);
    s
}

/// Random 256-bit token, base64url (no padding) encoded. Used for
/// unguessable identifiers such as `AttachmentRef.ref` where collision
/// probability must be negligible.
pub fn random_token_b64url() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Obj {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_hash_is_stable() {
        let x = Obj { b: 2, a: 1 };
        let y = Obj { a: 1, b: 2 };
        let hx = sha256_canonical_json(&x).unwrap();
        let hy = sha256_canonical_json(&y).unwrap();
        assert_eq!(hx, hy);
    }

    #[test]
    fn constant_time_eq_matches_eq_semantics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn random_token_is_url_safe_and_unique() {
        let a = random_token_b64url();
        let b = random_token_b64url();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
