//! broker-control
//!
//! Operator surface for the broker (spec.md §4 "operator tooling"): vault
//! CRUD, session token minting for local testing, audit log verification,
//! and a `hosts` listing mirroring the gated `GET /hosts` introspection
//! endpoint. Runs offline against the vault file directly — it does not
//! talk to a running `broker-vaultd`, so credentials can be provisioned
//! before the broker is ever started.

use broker_audit_spec::{Actor, Category, Component as AuditComponent, Decision, EventDetail, RequestId, VaultAccessDetail};
use broker_vault::{Credential, StoreOpts, VaultStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vault error: {0}")]
    Vault(#[from] broker_vault::VaultError),
    #[error("audit log error: {0}")]
    Audit(#[from] broker_audit_log::AuditLogError),
    #[error("credential not found: {0}:{1}")]
    CredentialNotFound(String, String),
    #[error("VAULT_PASSPHRASE is required (env var or --passphrase)")]
    MissingPassphrase,
}

#[derive(Parser)]
#[command(name = "broker-control", version, about = "Security broker operator CLI")]
struct Args {
    /// Path to the encrypted vault file. Falls back to VAULT_PATH.
    #[arg(long, global = true)]
    vault_path: Option<PathBuf>,

    /// Vault passphrase. Falls back to VAULT_PASSPHRASE. Prefer the env var
    /// over the flag on a shared machine (flags show up in process lists).
    #[arg(long, global = true)]
    passphrase: Option<String>,

    /// Directory the daily-rotating audit log is written into. Falls back
    /// to AUDIT_LOG_DIR.
    #[arg(long, global = true)]
    audit_log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store (or overwrite) a credential entry for `protocol:target`.
    VaultStore {
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        target: String,
        /// Credential JSON, e.g. {"type":"api_key","header":"Authorization","token":"sk-..."}
        #[arg(long)]
        credential_json: String,
        #[arg(long)]
        label: Option<String>,
        /// Allowed path regexes for this entry (repeatable).
        #[arg(long = "allowed-path")]
        allowed_paths: Vec<String>,
        #[arg(long)]
        rate_limit_per_minute: Option<u32>,
        #[arg(long)]
        expires_at: Option<f64>,
    },

    /// Print the full stored entry, including the secret. Operator-only.
    VaultGet {
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        target: String,
    },

    /// Delete a credential entry.
    VaultDelete {
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        target: String,
    },

    /// List configured credential metadata (no secret material), optionally
    /// filtered by protocol. Mirrors `GET /hosts`.
    Hosts {
        #[arg(long)]
        protocol: Option<String>,
    },

    /// Mint a session token for local testing.
    SessionMint {
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value_t = 3600.0)]
        ttl_secs: f64,
        /// Falls back to SESSION_SIGNING_KEY.
        #[arg(long)]
        signing_key: Option<String>,
    },

    /// Verify a hash-chained audit log JSONL file and print its final hash.
    VerifyAudit {
        #[arg(long)]
        path: PathBuf,
    },

    /// Check whether a host would be allowed to egress under a given
    /// network mode and allow-list (debug aid for operators tuning
    /// NETWORK_MODE / ADDITIONAL_DOMAINS).
    CheckHost {
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "strict")]
        network_mode: String,
        #[arg(long = "additional-domain")]
        additional_domains: Vec<String>,
        #[arg(long = "blocked-domain")]
        blocked_domains: Vec<String>,
    },

    /// Check whether a path string would trip the tool-call guardrail's
    /// sensitive-path predicate (debug aid for operators tuning tool
    /// allow-lists before rolling a permission tier out).
    CheckPath {
        #[arg(long)]
        path: String,
        #[arg(long)]
        broker_data_dir: PathBuf,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    match args.cmd {
        Command::VaultStore { protocol, target, credential_json, label, allowed_paths, rate_limit_per_minute, expires_at } => {
            let mut store = open_vault(&args.vault_path, &args.passphrase)?;
            let credential: Credential = serde_json::from_str(&credential_json)?;
            let opts = StoreOpts {
                label,
                allowed_paths: if allowed_paths.is_empty() { None } else { Some(allowed_paths) },
                rate_limit_per_minute,
                expires_at,
            };
            store.store(&protocol, &target, credential, opts)?;
            append_vault_audit(&args.audit_log_dir, "store", &protocol, &target, Decision::Allow)?;
            println!("stored {protocol}:{target}");
            Ok(())
        }

        Command::VaultGet { protocol, target } => {
            let mut store = open_vault(&args.vault_path, &args.passphrase)?;
            let entry = store
                .get(&protocol, &target)?
                .ok_or_else(|| CliError::CredentialNotFound(protocol.clone(), target.clone()))?;
            append_vault_audit(&args.audit_log_dir, "get", &protocol, &target, Decision::Allow)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }

        Command::VaultDelete { protocol, target } => {
            let mut store = open_vault(&args.vault_path, &args.passphrase)?;
            let removed = store.delete(&protocol, &target)?;
            append_vault_audit(&args.audit_log_dir, "delete", &protocol, &target, Decision::Allow)?;
            println!("{{\"removed\":{removed}}}");
            Ok(())
        }

        Command::Hosts { protocol } => {
            let mut store = open_vault(&args.vault_path, &args.passphrase)?;
            let listed = store.list(protocol.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&listed)?);
            Ok(())
        }

        Command::SessionMint { session_id, ttl_secs, signing_key } => {
            let key = signing_key
                .or_else(|| std::env::var("SESSION_SIGNING_KEY").ok())
                .unwrap_or_else(|| {
                    eprintln!("warning: no SESSION_SIGNING_KEY set, using an ephemeral key (token will not validate elsewhere)");
                    broker_common::random_hex(32)
                });
            let signer = broker_session::SessionSigner::new(key.into_bytes());
            let token = signer.mint(&session_id, ttl_secs);
            println!("{token}");
            Ok(())
        }

        Command::VerifyAudit { path } => {
            let last_hash = broker_audit_log::verify_log(&path)?;
            println!("{last_hash}");
            Ok(())
        }

        Command::CheckHost { host, network_mode, additional_domains, blocked_domains } => {
            let mode: broker_netguard::NetworkMode = network_mode.parse().unwrap_or_else(|_| {
                eprintln!("unknown network mode '{network_mode}', defaulting to strict");
                broker_netguard::NetworkMode::Strict
            });
            let allowed = broker_netguard::network_mode_permits(&host, mode, &blocked_domains, &additional_domains);
            println!("{{\"host\":\"{host}\",\"mode\":\"{network_mode}\",\"allowed\":{allowed}}}");
            Ok(())
        }

        Command::CheckPath { path, broker_data_dir } => {
            let sensitive = broker_guardrail::is_sensitive_path_str(&path, &broker_data_dir);
            println!("{{\"path\":\"{path}\",\"sensitive\":{sensitive}}}");
            Ok(())
        }
    }
}

fn open_vault(path: &Option<PathBuf>, passphrase: &Option<String>) -> Result<VaultStore, CliError> {
    let path = path
        .clone()
        .or_else(|| std::env::var("VAULT_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./vault.json"));
    let passphrase = passphrase
        .clone()
        .or_else(|| std::env::var("VAULT_PASSPHRASE").ok())
        .ok_or(CliError::MissingPassphrase)?;
    Ok(VaultStore::open(path, &passphrase)?)
}

fn append_vault_audit(
    audit_log_dir: &Option<PathBuf>,
    op: &str,
    protocol: &str,
    target: &str,
    decision: Decision,
) -> Result<(), CliError> {
    let dir = audit_log_dir
        .clone()
        .or_else(|| std::env::var("AUDIT_LOG_DIR").ok().map(PathBuf::from));
    let Some(dir) = dir else {
        return Ok(());
    };
    let mut log = broker_audit_log::DailyAuditLog::open(dir)?;
    let event = broker_audit_spec::AuditEvent::new(
        RequestId::new(),
        Actor::operator(),
        AuditComponent::Vault,
        Category::VaultOk,
        decision,
        EventDetail::VaultAccess(VaultAccessDetail {
            op: op.to_string(),
            protocol: Some(protocol.to_string()),
            target: Some(target.to_string()),
        }),
    );
    log.append(event)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_vault_fails_without_a_passphrase() {
        let err = open_vault(&Some(PathBuf::from("/tmp/does-not-matter.json")), &None);
        assert!(matches!(err, Err(CliError::MissingPassphrase)));
    }
}
