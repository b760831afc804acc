//! broker_session
//!
//! Session tokens (component C): opaque, HMAC-signed, short-lived
//! capability tokens minted once per chat session and validated in
//! constant time. The "relay-local" sentinel session id is recognized
//! only when the caller is known (by the admitting proxy) to be loopback.

use broker_common::{b64url_decode, b64url_encode, constant_time_eq, now_unix_secs_f64};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: u8 = 1;
pub const RELAY_LOCAL_SESSION_ID: &str = "relay-local";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPayload {
    pub version: u8,
    pub session_id: String,
    pub created_at: f64,
    pub expires_at: f64,
}

pub struct SessionSigner {
    key: Vec<u8>,
}

impl SessionSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Mint a token for `session_id`, valid for `ttl_secs` from now.
    pub fn mint(&self, session_id: &str, ttl_secs: f64) -> String {
        let now = now_unix_secs_f64();
        let payload = SessionPayload {
            version: TOKEN_VERSION,
            session_id: session_id.to_string(),
            created_at: now,
            expires_at: now + ttl_secs,
        };
        self.encode(&payload)
    }

    fn encode(&self, payload: &SessionPayload) -> String {
        let payload_bytes = serde_json::to_vec(payload).expect("SessionPayload always serializes");
        let tag = self.tag(&payload_bytes);
        format!("{}.{}", b64url_encode(&payload_bytes), b64url_encode(&tag))
    }

    fn tag(&self, payload_bytes: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload_bytes);
        mac.finalize().into_bytes().to_vec()
    }

    /// Validate `token`, rejecting on tag mismatch, expiry, or version
    /// mismatch. Runs in constant time with respect to the signing key:
    /// the HMAC tag comparison never short-circuits on a byte mismatch.
    pub fn validate(&self, token: &str) -> Option<SessionPayload> {
        let (payload_part, tag_part) = token.split_once('.')?;
        let payload_bytes = b64url_decode(payload_part)?;
        let tag_bytes = b64url_decode(tag_part)?;

        let expected_tag = self.tag(&payload_bytes);
        if !constant_time_eq(&expected_tag, &tag_bytes) {
            return None;
        }

        let payload: SessionPayload = serde_json::from_slice(&payload_bytes).ok()?;
        if payload.version != TOKEN_VERSION {
            return None;
        }
        if now_unix_secs_f64() > payload.expires_at {
            return None;
        }
        Some(payload)
    }
}

/// The "relay-local" sentinel session id bypasses normal token validation,
/// but only when the caller's transport-level peer address is loopback —
/// a forged `X-Session: relay-local` header from a non-loopback peer must
/// never be honored.
pub fn is_relay_local_session(session_header: Option<&str>, peer_is_loopback: bool) -> bool {
    session_header == Some(RELAY_LOCAL_SESSION_ID) && peer_is_loopback
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SessionSigner {
        SessionSigner::new(b"test-signing-key-0123456789abcdef".to_vec())
    }

    #[test]
    fn mint_then_validate_roundtrips() {
        let s = signer();
        let token = s.mint("sess-1", 3600.0);
        let payload = s.validate(&token).unwrap();
        assert_eq!(payload.session_id, "sess-1");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let s = signer();
        let token = s.mint("sess-1", 3600.0);
        let mut chars: Vec<char> = token.chars().collect();
        let mid = chars.iter().position(|&c| c == '.').unwrap() / 2;
        chars[mid] = if chars[mid] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(s.validate(&tampered).is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let s = signer();
        let token = s.mint("sess-1", -1.0);
        assert!(s.validate(&token).is_none());
    }

    #[test]
    fn wrong_signing_key_is_rejected() {
        let s1 = SessionSigner::new(b"key-one".to_vec());
        let s2 = SessionSigner::new(b"key-two".to_vec());
        let token = s1.mint("sess-1", 3600.0);
        assert!(s2.validate(&token).is_none());
    }

    #[test]
    fn relay_local_requires_loopback_peer() {
        assert!(is_relay_local_session(Some("relay-local"), true));
        assert!(!is_relay_local_session(Some("relay-local"), false));
        assert!(!is_relay_local_session(Some("relay-local-fake"), true));
    }
}
