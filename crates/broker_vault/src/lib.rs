//! broker_vault
//!
//! File-backed, encrypted key-value store for credentials (component A).
//! The on-disk file is a JSON document `{ version, salt, entries }`; each
//! entry is AES-256-GCM ciphertext with a random 96-bit IV, keyed by a
//! scrypt-derived key over the file's persistent salt and an
//! operator-supplied passphrase.
//!
//! Storage key = "{protocol}:{target}". Secrets are never returned from
//! `list()`; only metadata.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vault file is corrupt: {0}")]
    Corrupt(String),
    #[error("encryption failure")]
    Crypto,
    #[error("credential not found for {0}")]
    NotFound(String),
    #[error("credential is not an oauth2 entry: {0}")]
    NotOAuth(String),
}

// ---------------------------------------------------------------------
// Credential model (spec.md §3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Bearer { token: String },
    ApiKey { header: String, token: String },
    Basic { username: String, password: String },
    Query { param: String, token: String },
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        refresh_token: String,
        expires_at: f64,
        scopes: Vec<String>,
        refresh_url: String,
        client_id: String,
    },
    Opaque { value: String },
}

impl Credential {
    pub fn type_name(&self) -> &'static str {
        match self {
            Credential::Bearer { .. } => "bearer",
            Credential::ApiKey { .. } => "api_key",
            Credential::Basic { .. } => "basic",
            Credential::Query { .. } => "query",
            Credential::OAuth2 { .. } => "oauth2",
            Credential::Opaque { .. } => "opaque",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub protocol: String,
    pub target: String,
    pub credential: Credential,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: f64,
    #[serde(default)]
    pub expires_at: Option<f64>,
}

/// Metadata-only view returned by `list()`. Never carries secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub protocol: String,
    pub target: String,
    pub credential_type: String,
    pub label: Option<String>,
    pub created_at: f64,
    pub expires_at: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOpts {
    pub label: Option<String>,
    pub allowed_paths: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
    pub expires_at: Option<f64>,
}

// ---------------------------------------------------------------------
// On-disk file format
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedBlob {
    iv: String,
    data: String,
    tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    salt: String,
    entries: HashMap<String, EncryptedBlob>,
}

impl VaultFile {
    fn empty() -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { version: 1, salt: base64::encode_salt(&salt), entries: HashMap::new() }
    }
}

mod base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    pub fn encode_salt(b: &[u8]) -> String {
        STANDARD.encode(b)
    }
    pub fn decode(s: &str) -> Option<Vec<u8>> {
        STANDARD.decode(s).ok()
    }
}

fn storage_key(protocol: &str, target: &str) -> String {
    format!("{protocol}:{target}")
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}
#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------

pub struct VaultStore {
    path: PathBuf,
    passphrase: String,
    file: VaultFile,
    derived_key: [u8; 32],
    derived_for_salt: String,
}

impl VaultStore {
    /// Open (creating if absent) the vault at `path`, deriving the
    /// encryption key from `passphrase`. On read-time parse failure the
    /// corrupt file is renamed aside and this call fails closed — the
    /// store never silently resets.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
                restrict_dir(parent)?;
            }
        }

        let file = if path.exists() {
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<VaultFile>(&bytes) {
                Ok(f) => f,
                Err(e) => {
                    let aside = path.with_extension(format!(
                        "json.corrupt-{}",
                        broker_common::now_unix_ms()
                    ));
                    let _ = fs::rename(&path, &aside);
                    return Err(VaultError::Corrupt(format!(
                        "{e}; original renamed to {}",
                        aside.display()
                    )));
                }
            }
        } else {
            let f = VaultFile::empty();
            let bytes = serde_json::to_vec_pretty(&f)?;
            fs::write(&path, &bytes)?;
            restrict_file(&path)?;
            f
        };

        let salt_bytes = base64::decode(&file.salt)
            .ok_or_else(|| VaultError::Corrupt("salt is not valid base64".into()))?;
        let derived_key = derive_key(passphrase, &salt_bytes)?;

        Ok(Self {
            path,
            passphrase: passphrase.to_string(),
            derived_for_salt: file.salt.clone(),
            file,
            derived_key,
        })
    }

    fn ensure_key_current(&mut self) -> Result<(), VaultError> {
        if self.derived_for_salt != self.file.salt {
            let salt_bytes = base64::decode(&self.file.salt)
                .ok_or_else(|| VaultError::Corrupt("salt is not valid base64".into()))?;
            self.derived_key = derive_key(&self.passphrase, &salt_bytes)?;
            self.derived_for_salt = self.file.salt.clone();
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec_pretty(&self.file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        restrict_file(&tmp_path)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn store(
        &mut self,
        protocol: &str,
        target: &str,
        credential: Credential,
        opts: StoreOpts,
    ) -> Result<(), VaultError> {
        self.ensure_key_current()?;
        let entry = CredentialEntry {
            protocol: protocol.to_string(),
            target: target.to_string(),
            credential,
            label: opts.label,
            allowed_paths: opts.allowed_paths,
            rate_limit_per_minute: opts.rate_limit_per_minute,
            created_at: broker_common::now_unix_secs_f64(),
            expires_at: opts.expires_at,
        };
        let blob = self.encrypt_entry(&entry)?;
        self.file.entries.insert(storage_key(protocol, target), blob);
        self.persist()?;
        Ok(())
    }

    pub fn get(&mut self, protocol: &str, target: &str) -> Result<Option<CredentialEntry>, VaultError> {
        self.ensure_key_current()?;
        match self.file.entries.get(&storage_key(protocol, target)) {
            Some(blob) => Ok(Some(self.decrypt_entry(blob)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, protocol: &str, target: &str) -> bool {
        self.file.entries.contains_key(&storage_key(protocol, target))
    }

    pub fn delete(&mut self, protocol: &str, target: &str) -> Result<bool, VaultError> {
        let removed = self.file.entries.remove(&storage_key(protocol, target)).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list(&mut self, protocol: Option<&str>) -> Result<Vec<ListEntry>, VaultError> {
        self.ensure_key_current()?;
        let mut out = Vec::new();
        // Clone keys first to avoid borrowing self.file.entries while self is mutably used.
        let keys: Vec<String> = self.file.entries.keys().cloned().collect();
        for key in keys {
            let blob = self.file.entries.get(&key).unwrap().clone();
            let entry = self.decrypt_entry(&blob)?;
            if let Some(p) = protocol {
                if entry.protocol != p {
                    continue;
                }
            }
            out.push(ListEntry {
                protocol: entry.protocol,
                target: entry.target,
                credential_type: entry.credential.type_name().to_string(),
                label: entry.label,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            });
        }
        out.sort_by(|a, b| (a.protocol.as_str(), a.target.as_str()).cmp(&(b.protocol.as_str(), b.target.as_str())));
        Ok(out)
    }

    /// OAuth-aware token lookup: returns the current `access_token` string
    /// for the `oauth2:{target}` entry. Refresh is owned by the LLM proxy
    /// (component E) under its single-flight lock; this call never
    /// performs network I/O and never mutates the stored token.
    pub fn get_oauth_access_token(&mut self, target: &str) -> Result<String, VaultError> {
        let entry = self
            .get("oauth2", target)?
            .ok_or_else(|| VaultError::NotFound(format!("oauth2:{target}")))?;
        match entry.credential {
            Credential::OAuth2 { access_token, .. } => Ok(access_token),
            other => Err(VaultError::NotOAuth(other.type_name().to_string())),
        }
    }

    fn encrypt_entry(&self, entry: &CredentialEntry) -> Result<EncryptedBlob, VaultError> {
        let plaintext = serde_json::to_vec(entry)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.derived_key));
        let mut iv_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| VaultError::Crypto)?;
        // aes-gcm appends the 16-byte tag to the ciphertext; split it out so
        // the on-disk schema carries iv/data/tag as documented.
        let tag = ciphertext.split_off(ciphertext.len() - 16);
        Ok(EncryptedBlob {
            iv: base64::encode_salt(&iv_bytes),
            data: base64::encode_salt(&ciphertext),
            tag: base64::encode_salt(&tag),
        })
    }

    fn decrypt_entry(&self, blob: &EncryptedBlob) -> Result<CredentialEntry, VaultError> {
        let iv = base64::decode(&blob.iv).ok_or(VaultError::Crypto)?;
        let mut data = base64::decode(&blob.data).ok_or(VaultError::Crypto)?;
        let tag = base64::decode(&blob.tag).ok_or(VaultError::Crypto)?;
        data.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.derived_key));
        let nonce = Nonce::from_slice(&iv);
        let plaintext = cipher.decrypt(nonce, data.as_ref()).map_err(|_| VaultError::Crypto)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], VaultError> {
    use scrypt::{scrypt, Params};
    let params = Params::new(15, 8, 1, 32).map_err(|_| VaultError::Crypto)?;
    let mut out = [0u8; 32];
    scrypt(passphrase.as_bytes(), salt, &params, &mut out).map_err(|_| VaultError::Crypto)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> PathBuf {
        std::env::temp_dir().join(format!("broker_vault_test_{}.json", broker_common::random_hex(16)))
    }

    #[test]
    fn store_then_get_roundtrips() {
        let path = tmp_path();
        let mut store = VaultStore::open(&path, "correct horse battery staple").unwrap();
        store
            .store(
                "http",
                "api.openai.com",
                Credential::ApiKey { header: "Authorization".into(), token: "sk-test-XYZ".into() },
                StoreOpts::default(),
            )
            .unwrap();

        let got = store.get("http", "api.openai.com").unwrap().unwrap();
        match got.credential {
            Credential::ApiKey { header, token } => {
                assert_eq!(header, "Authorization");
                assert_eq!(token, "sk-test-XYZ");
            }
            _ => panic!("wrong credential type"),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let path = tmp_path();
        {
            let mut store = VaultStore::open(&path, "right-pass").unwrap();
            store
                .store("http", "x.com", Credential::Bearer { token: "t".into() }, StoreOpts::default())
                .unwrap();
        }
        let mut store2 = VaultStore::open(&path, "wrong-pass").unwrap();
        assert!(store2.get("http", "x.com").is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn list_never_exposes_secret() {
        let path = tmp_path();
        let mut store = VaultStore::open(&path, "pw").unwrap();
        store
            .store("http", "x.com", Credential::Bearer { token: "super-secret".into() }, StoreOpts::default())
            .unwrap();
        let listed = store.list(None).unwrap();
        let dumped = serde_json::to_string(&listed).unwrap();
        assert!(!dumped.contains("super-secret"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_fails_closed_and_is_renamed_aside() {
        let path = tmp_path();
        fs::write(&path, b"not json at all").unwrap();
        let result = VaultStore::open(&path, "pw");
        assert!(result.is_err());
        assert!(!path.exists());
        // the renamed-aside file should exist somewhere in the same dir
        let dir = path.parent().unwrap();
        let has_corrupt = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(has_corrupt);
    }

    #[test]
    fn delete_removes_entry() {
        let path = tmp_path();
        let mut store = VaultStore::open(&path, "pw").unwrap();
        store
            .store("http", "x.com", Credential::Bearer { token: "t".into() }, StoreOpts::default())
            .unwrap();
        assert!(store.delete("http", "x.com").unwrap());
        assert!(store.get("http", "x.com").unwrap().is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oauth_token_lookup_rejects_non_oauth_entries() {
        let path = tmp_path();
        let mut store = VaultStore::open(&path, "pw").unwrap();
        store
            .store("oauth2", "anthropic", Credential::Bearer { token: "t".into() }, StoreOpts::default())
            .unwrap();
        assert!(store.get_oauth_access_token("anthropic").is_err());
        let _ = fs::remove_file(&path);
    }
}
