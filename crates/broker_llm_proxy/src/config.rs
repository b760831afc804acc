//! Environment-variable configuration for `broker-llm-proxy` (component
//! E).

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
    /// Shared secret compared (constant-time) against `Authorization:
    /// Bearer <token>` or `X-API-Key: <token>`.
    pub proxy_token: String,
    /// The fixed upstream origin this proxy forwards `/v1/llm-proxy/{rest}`
    /// onto, e.g. `https://api.anthropic.com`.
    pub upstream_origin: url::Url,
    /// `(protocol, target)` of the vault's api-key entry for this LLM
    /// host — credential-resolution source (1).
    pub api_key_protocol: String,
    pub api_key_target: String,
    /// `target` of the vault's oauth2 secret — source (2).
    pub oauth_target: String,
    /// Environment variable carrying a fallback bearer token — source (3).
    pub env_token_var: String,
    /// On-disk credentials file (bearer token, first line) — source (4).
    pub credentials_file: Option<std::path::PathBuf>,
    pub oauth_refresh_margin: Duration,
    pub default_rate_limit_per_minute: u32,
    pub body_limit_bytes: usize,
    pub upstream_timeout: Duration,
    pub vault_rpc_timeout: Duration,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_str = env_var_or("LLM_PROXY_BIND", "127.0.0.1:8082");
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "LLM_PROXY_BIND", value: bind_str.clone() })?;

        let vault_socket_path =
            std::path::PathBuf::from(env_var_or("VAULT_SOCKET_PATH", "/run/broker/vault.sock"));

        let proxy_token = env_var("LLM_PROXY_TOKEN")?;

        let origin_str = env_var_or("LLM_UPSTREAM_ORIGIN", "https://api.anthropic.com");
        let upstream_origin = url::Url::parse(&origin_str)
            .map_err(|_| ConfigError::Invalid { name: "LLM_UPSTREAM_ORIGIN", value: origin_str.clone() })?;

        let rate_str = env_var_or("PROXY_RATE_LIMIT", "60");
        let default_rate_limit_per_minute: u32 = rate_str
            .parse()
            .map_err(|_| ConfigError::Invalid { name: "PROXY_RATE_LIMIT", value: rate_str.clone() })?;

        Ok(Self {
            bind,
            vault_socket_path,
            proxy_token,
            api_key_protocol: env_var_or("LLM_CREDENTIAL_PROTOCOL", "llm"),
            api_key_target: upstream_origin.host_str().unwrap_or("llm-upstream").to_string(),
            oauth_target: env_var_or("LLM_OAUTH_TARGET", "anthropic-oauth"),
            env_token_var: env_var_or("LLM_UPSTREAM_TOKEN_VAR", "LLM_UPSTREAM_TOKEN"),
            credentials_file: std::env::var("LLM_CREDENTIALS_FILE").ok().map(std::path::PathBuf::from),
            upstream_origin,
            oauth_refresh_margin: crate::oauth::DEFAULT_REFRESH_MARGIN,
            default_rate_limit_per_minute,
            body_limit_bytes: broker_proxy_core::DEFAULT_BODY_LIMIT,
            upstream_timeout: broker_proxy_core::DEFAULT_UPSTREAM_TIMEOUT,
            vault_rpc_timeout: Duration::from_secs(5),
        })
    }
}
