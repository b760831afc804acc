//! Environment-variable configuration for `broker-http-proxy` (component
//! D), covering the inputs spec.md §6 enumerates that this binary reads.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub vault_socket_path: std::path::PathBuf,
    pub session_signing_key: Vec<u8>,
    /// Default per-session, per-minute request budget; an individual
    /// `CredentialEntry.rate_limit_per_minute` overrides this for the
    /// per-credential counter.
    pub default_rate_limit_per_minute: u32,
    pub body_limit_bytes: usize,
    pub upstream_timeout: Duration,
    pub vault_rpc_timeout: Duration,
    /// Gates `GET /hosts` (spec.md §4.D "operator-only toggle"); off by
    /// default so target inventory is never disclosed accidentally.
    pub expose_hosts_endpoint: bool,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_str = env_var_or("PROXY_BIND", "127.0.0.1:8081");
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "PROXY_BIND", value: bind_str.clone() })?;

        let vault_socket_path =
            std::path::PathBuf::from(env_var_or("VAULT_SOCKET_PATH", "/run/broker/vault.sock"));

        let session_signing_key = env_var("SESSION_SIGNING_KEY")?.into_bytes();

        let rate_str = env_var_or("PROXY_RATE_LIMIT", "60");
        let default_rate_limit_per_minute: u32 = rate_str
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "PROXY_RATE_LIMIT", value: rate_str.clone() })?;

        let expose_hosts_endpoint = matches!(
            env_var_or("BROKER_EXPOSE_HOSTS", "false").to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            bind,
            vault_socket_path,
            session_signing_key,
            default_rate_limit_per_minute,
            body_limit_bytes: broker_proxy_core::DEFAULT_BODY_LIMIT,
            upstream_timeout: broker_proxy_core::DEFAULT_UPSTREAM_TIMEOUT,
            vault_rpc_timeout: Duration::from_secs(5),
            expose_hosts_endpoint,
        })
    }
}
