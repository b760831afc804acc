//! broker_attachments
//!
//! Attachment interceptor (component F). Rewrites provider JSON responses
//! that carry an `attachments[]` array: inline base64 payloads are
//! validated, decoded, persisted under a private outbox directory, and
//! replaced with an opaque `ref`. The ref table is mirrored to a sidecar
//! JSON file so refs (and the files they point at) survive a broker
//! restart — the alternative, in-memory-only table, would silently 404 a
//! ref the agent still holds after a restart.
//!
//! Non-JSON responses are never rewritten here; the calling proxy is
//! responsible for refusing such a response on a route that expects
//! attachments.

use base64::Engine;
use broker_common::{now_unix_ms, random_hex, random_token_b64url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment exceeds the {0} byte limit")]
    TooLarge(usize),
    #[error("attachment is not valid base64")]
    BadEncoding,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    #[serde(rename = "ref")]
    pub ref_id: String,
    pub actor_user_id: Option<String>,
    pub provider_id: Option<String>,
    pub filepath: PathBuf,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub created_at: f64,
}

/// Who minted the request that produced this response, for audit and for
/// scoping refs if a future caller wants per-actor listing.
#[derive(Debug, Clone, Default)]
pub struct InterceptContext {
    pub actor_user_id: Option<String>,
    pub provider_id: Option<String>,
}

struct Inner {
    refs: HashMap<String, AttachmentRef>,
}

pub struct AttachmentStore {
    outbox_dir: PathBuf,
    sidecar_path: PathBuf,
    inner: Mutex<Inner>,
}

impl AttachmentStore {
    /// Opens (creating if absent) the outbox at `outbox_dir`, loading any
    /// previously persisted refs from its sidecar file.
    pub fn open(outbox_dir: impl Into<PathBuf>) -> Result<Self, AttachmentError> {
        let outbox_dir = outbox_dir.into();
        let documents_dir = outbox_dir.join("documents");
        std::fs::create_dir_all(&documents_dir)?;
        restrict_dir(&outbox_dir)?;
        restrict_dir(&documents_dir)?;

        let sidecar_path = outbox_dir.join("refs.json");
        let refs = if sidecar_path.exists() {
            let bytes = std::fs::read(&sidecar_path)?;
            serde_json::from_slice::<Vec<AttachmentRef>>(&bytes)
                .unwrap_or_default()
                .into_iter()
                .map(|r| (r.ref_id.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self { outbox_dir, sidecar_path, inner: Mutex::new(Inner { refs }) })
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.outbox_dir.join("documents")
    }

    pub fn get(&self, ref_id: &str) -> Option<AttachmentRef> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).refs.get(ref_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, r: AttachmentRef) -> Result<(), AttachmentError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.refs.insert(r.ref_id.clone(), r);
        self.persist_locked(&guard)
    }

    fn persist_locked(&self, inner: &Inner) -> Result<(), AttachmentError> {
        let all: Vec<&AttachmentRef> = inner.refs.values().collect();
        let bytes = serde_json::to_vec_pretty(&all)?;
        let tmp = self.sidecar_path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        restrict_file(&tmp)?;
        std::fs::rename(&tmp, &self.sidecar_path)?;
        Ok(())
    }

    /// Drops refs (and their backing files) whose `created_at` predates
    /// `now - ttl`. Intended to run periodically from `spawn_sweeper`.
    pub fn sweep(&self, ttl: Duration) {
        let cutoff = broker_common::now_unix_secs_f64() - ttl.as_secs_f64();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();
        guard.refs.retain(|_, r| {
            if r.created_at < cutoff {
                expired.push(r.clone());
                false
            } else {
                true
            }
        });
        for r in &expired {
            let _ = std::fs::remove_file(&r.filepath);
        }
        if !expired.is_empty() {
            let _ = self.persist_locked(&guard);
        }
    }
}

/// Spawns a background task that sweeps expired refs every `interval`.
pub fn spawn_sweeper(
    store: std::sync::Arc<AttachmentStore>,
    interval: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.sweep(ttl);
        }
    })
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}
#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Strips anything outside `[A-Za-z0-9._-]` and a leading dot, so the
/// result can never be read as a hidden file or escape the outbox via a
/// leading `..`.
fn sanitize_stem(name: &str) -> String {
    let cleaned: String =
        name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-').collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Splits `filename` into a sanitized stem and a lowercased alphanumeric
/// extension, defaulting to `attachment`/`bin` when absent or unsafe.
fn split_stem_ext(filename: Option<&str>) -> (String, String) {
    match filename {
        Some(f) => {
            let path = Path::new(f);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(sanitize_stem)
                .unwrap_or_else(|| "attachment".to_string());
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "bin".to_string());
            (stem, ext)
        }
        None => ("attachment".to_string(), "bin".to_string()),
    }
}

fn is_strict_base64(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.len() % 4 != 0 {
        return false;
    }
    let pad = s.bytes().rev().take_while(|&b| b == b'=').count();
    if pad > 2 {
        return false;
    }
    s.bytes().enumerate().all(|(i, b)| {
        if i >= s.len() - pad {
            b == b'='
        } else {
            b.is_ascii_alphanumeric() || b == b'+' || b == b'/'
        }
    })
}

/// Decoded byte length implied by a base64 string's own length, computed
/// without decoding it — used to reject oversized payloads (spec step 1)
/// before doing any real work on attacker-controlled input.
fn decoded_size_estimate(b64: &str) -> usize {
    if b64.len() < 4 {
        return 0;
    }
    let pad = b64.bytes().rev().take_while(|&b| b == b'=').count().min(2);
    (b64.len() / 4) * 3 - pad
}

/// Rewrites every element of a top-level `attachments` array in `body`:
/// inline base64 payloads are decoded, persisted to the outbox, and
/// replaced with an opaque `ref`. Elements without an `inline` field are
/// left untouched. Returns the refs minted so the caller can audit them.
pub fn intercept_attachments(
    store: &AttachmentStore,
    body: &mut serde_json::Value,
    ctx: &InterceptContext,
) -> Result<Vec<AttachmentRef>, AttachmentError> {
    let mut minted = Vec::new();
    let Some(attachments) = body.get_mut("attachments").and_then(|v| v.as_array_mut()) else {
        return Ok(minted);
    };

    for element in attachments.iter_mut() {
        let Some(obj) = element.as_object_mut() else { continue };
        let Some(inline) = obj.get("inline").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
            continue;
        };

        if decoded_size_estimate(&inline) > MAX_ATTACHMENT_BYTES {
            return Err(AttachmentError::TooLarge(MAX_ATTACHMENT_BYTES));
        }
        if !is_strict_base64(&inline) {
            return Err(AttachmentError::BadEncoding);
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&inline)
            .map_err(|_| AttachmentError::BadEncoding)?;

        obj.remove("inline");
        if decoded.is_empty() {
            continue;
        }

        let filename = obj.get("filename").and_then(|v| v.as_str()).map(|s| s.to_string());
        let mime_type = obj
            .get("mimeType")
            .or_else(|| obj.get("mime_type"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let (stem, ext) = split_stem_ext(filename.as_deref());
        let on_disk_name = format!("{stem}-{}-{}.{ext}", now_unix_ms(), random_hex(8));
        let filepath = store.documents_dir().join(&on_disk_name);
        std::fs::write(&filepath, &decoded)?;
        restrict_file(&filepath)?;

        let attachment_ref = AttachmentRef {
            ref_id: format!("att_{}", random_token_b64url()),
            actor_user_id: ctx.actor_user_id.clone(),
            provider_id: ctx.provider_id.clone(),
            filepath,
            filename,
            mime_type,
            size: Some(decoded.len() as u64),
            created_at: broker_common::now_unix_secs_f64(),
        };

        obj.insert("ref".to_string(), serde_json::Value::String(attachment_ref.ref_id.clone()));
        obj.insert("size".to_string(), serde_json::Value::from(attachment_ref.size.unwrap()));

        store.insert(attachment_ref.clone())?;
        minted.push(attachment_ref);
    }

    Ok(minted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_store() -> (tempfile::TempDir, AttachmentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::open(dir.path().join("outbox")).unwrap();
        (dir, store)
    }

    #[test]
    fn strips_inline_and_mints_ref_for_nonempty_payload() {
        let (_dir, store) = tmp_store();
        let mut body = json!({
            "attachments": [
                { "id": "a1", "filename": "r.pdf", "mimeType": "application/pdf", "inline": base64::engine::general_purpose::STANDARD.encode("hello") }
            ]
        });
        let ctx = InterceptContext::default();
        let minted = intercept_attachments(&store, &mut body, &ctx).unwrap();

        assert_eq!(minted.len(), 1);
        let element = &body["attachments"][0];
        assert!(element.get("inline").is_none());
        assert!(element["ref"].as_str().unwrap().starts_with("att_"));
        assert_eq!(element["size"], 5);
        assert_eq!(element["filename"], "r.pdf");

        let on_disk = std::fs::read(&minted[0].filepath).unwrap();
        assert_eq!(on_disk, b"hello");
    }

    #[test]
    fn empty_decoded_payload_passes_through_without_ref() {
        let (_dir, store) = tmp_store();
        let mut body = json!({ "attachments": [ { "id": "a1", "inline": "" } ] });
        let minted = intercept_attachments(&store, &mut body, &InterceptContext::default()).unwrap();
        assert!(minted.is_empty());
        assert!(body["attachments"][0].get("inline").is_none());
        assert!(body["attachments"][0].get("ref").is_none());
    }

    #[test]
    fn rejects_invalid_base64_alphabet() {
        let (_dir, store) = tmp_store();
        let mut body = json!({ "attachments": [ { "id": "a1", "inline": "not*valid*base64!!" } ] });
        let err = intercept_attachments(&store, &mut body, &InterceptContext::default()).unwrap_err();
        assert!(matches!(err, AttachmentError::BadEncoding));
    }

    #[test]
    fn rejects_oversized_payload_before_decoding() {
        let (_dir, store) = tmp_store();
        // 28_000_000 base64 chars ~= 21MB decoded, over the 20MiB cap,
        // without ever allocating or decoding the (fake) payload.
        let huge = "A".repeat(28_000_000);
        let mut body = json!({ "attachments": [ { "id": "a1", "inline": huge } ] });
        let err = intercept_attachments(&store, &mut body, &InterceptContext::default()).unwrap_err();
        assert!(matches!(err, AttachmentError::TooLarge(_)));
    }

    #[test]
    fn refs_survive_a_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox");
        let ref_id;
        {
            let store = AttachmentStore::open(&outbox).unwrap();
            let mut body = json!({ "attachments": [ { "id": "a1", "filename": "x.txt", "inline": base64::engine::general_purpose::STANDARD.encode("data") } ] });
            let minted = intercept_attachments(&store, &mut body, &InterceptContext::default()).unwrap();
            ref_id = minted[0].ref_id.clone();
        }
        let reopened = AttachmentStore::open(&outbox).unwrap();
        assert!(reopened.get(&ref_id).is_some());
    }

    #[test]
    fn sweep_removes_expired_refs_and_files() {
        let (_dir, store) = tmp_store();
        let mut body = json!({ "attachments": [ { "id": "a1", "inline": base64::engine::general_purpose::STANDARD.encode("data") } ] });
        let minted = intercept_attachments(&store, &mut body, &InterceptContext::default()).unwrap();
        let filepath = minted[0].filepath.clone();
        assert!(filepath.exists());

        store.sweep(Duration::from_secs(0));
        assert!(store.get(&minted[0].ref_id).is_none());
        assert!(!filepath.exists());
    }

    #[test]
    fn sanitizes_unsafe_filename_characters() {
        let (stem, ext) = split_stem_ext(Some("../../etc/passwd; rm -rf.sh"));
        assert!(!stem.contains('/'));
        assert!(!stem.contains(' '));
        assert_eq!(ext, "sh");
    }

    #[test]
    fn strict_base64_rejects_bad_padding() {
        assert!(!is_strict_base64("abc=="));
        assert!(!is_strict_base64("ab=c"));
        assert!(is_strict_base64("abcd"));
        assert!(is_strict_base64(""));
    }
}
