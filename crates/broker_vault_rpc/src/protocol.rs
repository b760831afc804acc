//! Wire protocol for the vault Unix-socket RPC (component B).
//!
//! Framing is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload. Line-delimited JSON was rejected because `opaque` credential
//! blobs may contain embedded newlines; a length prefix avoids that
//! ambiguity without needing to escape payload bytes.

use broker_vault::{Credential, CredentialEntry, ListEntry};
use serde::{Deserialize, Serialize};

pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    Ping,
    Get { protocol: String, target: String },
    List { protocol: Option<String> },
    Store {
        protocol: String,
        target: String,
        credential: Credential,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        allowed_paths: Option<Vec<String>>,
        #[serde(default)]
        rate_limit_per_minute: Option<u32>,
        #[serde(default)]
        expires_at: Option<f64>,
    },
    Delete { protocol: String, target: String },
    #[serde(rename = "get-token")]
    GetToken { target: String },
    #[serde(rename = "get-secret")]
    GetSecret { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseOk {
    Pong,
    Get { entry: Option<CredentialEntry> },
    List { entries: Vec<ListEntry> },
    Store,
    Delete { deleted: bool },
    #[serde(rename = "get-token")]
    GetToken { token: String },
    #[serde(rename = "get-secret")]
    GetSecret { value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        ok: bool,
        #[serde(flatten)]
        body: ResponseOk,
    },
    Err {
        ok: bool,
        error: String,
    },
}

impl Response {
    pub fn ok(body: ResponseOk) -> Self {
        Response::Ok { ok: true, body }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Response::Err { ok: false, error: msg.into() }
    }
}
