//! broker_audit_log
//!
//! Append-only JSONL audit log with hash chaining.
//! - Each record includes: event, prev_hash, hash
//! - Hash is computed over canonical JSON of (prev_hash + event)
//! - `verify_log` replays a file and checks integrity end-to-end
//!
//! Every decision an agent-facing component makes is written here before
//! its side effect becomes observable (spec invariant: audit precedes
//! externally visible effect). Loss on crash is acceptable; duplication or
//! silent corruption is not — hence the hash chain.

use broker_audit_spec::AuditEvent;
use broker_common::sha256_canonical_json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] broker_common::CanonError),
    #[error("hash mismatch at line {line}: expected {expected}, got {got}")]
    HashMismatch { line: usize, expected: String, got: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub prev_hash: String, // sha256:... or the genesis hash
    pub hash: String,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, Serialize)]
struct HashPayload<'a> {
    prev_hash: &'a str,
    event: &'a AuditEvent,
}

pub fn genesis_hash() -> String {
    "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string()
}

pub fn compute_record_hash(prev_hash: &str, event: &AuditEvent) -> Result<String, AuditLogError> {
    let payload = HashPayload { prev_hash, event };
    Ok(sha256_canonical_json(&payload)?)
}

#[cfg(unix)]
fn restrict_perms(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_perms(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// A single append-only JSONL file with a running hash chain.
pub struct AuditAppender {
    file: File,
    last_hash: String,
}

impl AuditAppender {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        restrict_perms(path)?;
        Ok(Self { file, last_hash: genesis_hash() })
    }

    pub fn with_last_hash(mut self, last_hash: String) -> Self {
        self.last_hash = last_hash;
        self
    }

    pub fn append(&mut self, event: AuditEvent) -> Result<AuditRecord, AuditLogError> {
        let prev_hash = self.last_hash.clone();
        let hash = compute_record_hash(&prev_hash, &event)?;
        let record = AuditRecord { prev_hash, hash: hash.clone(), event };
        let line = serde_json::to_string(&record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.last_hash = hash;
        Ok(record)
    }
}

pub fn verify_log(path: impl AsRef<Path>) -> Result<String, AuditLogError> {
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut expected_prev = genesis_hash();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(&line)?;
        if rec.prev_hash != expected_prev {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: expected_prev,
                got: rec.prev_hash,
            });
        }
        let computed = compute_record_hash(&rec.prev_hash, &rec.event)?;
        if computed != rec.hash {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: computed,
                got: rec.hash,
            });
        }
        expected_prev = rec.hash;
    }

    Ok(expected_prev)
}

/// Wraps `AuditAppender`, rotating to a new `audit-YYYY-MM-DD.jsonl` file
/// whenever the UTC date rolls over. Each day's file carries its own hash
/// chain starting from genesis — chains are not required to span files.
pub struct DailyAuditLog {
    dir: PathBuf,
    current_date: chrono::NaiveDate,
    appender: AuditAppender,
}

impl DailyAuditLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let today = Utc::now().date_naive();
        let appender = AuditAppender::open(Self::path_for(&dir, today))?;
        Ok(Self { dir, current_date: today, appender })
    }

    fn path_for(dir: &Path, date: chrono::NaiveDate) -> PathBuf {
        dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn roll_if_needed(&mut self) -> Result<(), AuditLogError> {
        let today = Utc::now().date_naive();
        if today != self.current_date {
            self.appender = AuditAppender::open(Self::path_for(&self.dir, today))?;
            self.current_date = today;
        }
        Ok(())
    }

    pub fn append(&mut self, event: AuditEvent) -> Result<AuditRecord, AuditLogError> {
        self.roll_if_needed()?;
        self.appender.append(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_audit_spec::*;

    fn dummy_event() -> AuditEvent {
        AuditEvent::new(
            RequestId::new(),
            Actor::agent(Some("sess1".into())),
            Component::HttpProxy,
            Category::UpstreamOk,
            Decision::Allow,
            EventDetail::ProxyRequest(ProxyRequestDetail {
                method: "GET".into(),
                host: Some("api.example.com".into()),
                path: Some("/v1/x".into()),
                status: Some(200),
                reason: None,
            }),
        )
    }

    #[test]
    fn hash_chain_verifies() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);

        let mut app = AuditAppender::open(&path).unwrap();
        app.append(dummy_event()).unwrap();
        app.append(dummy_event()).unwrap();

        let last = verify_log(&path).unwrap();
        assert!(last.starts_with("sha256:"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tampering_breaks_verification() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);

        let mut app = AuditAppender::open(&path).unwrap();
        app.append(dummy_event()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("GET", "POST");
        std::fs::write(&path, tampered).unwrap();

        assert!(verify_log(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[cfg(unix)]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);

        let mut app = AuditAppender::open(&path).unwrap();
        app.append(dummy_event()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let _ = std::fs::remove_file(&path);
    }
}
