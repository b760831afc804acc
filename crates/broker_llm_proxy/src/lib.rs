//! broker_llm_proxy
//!
//! Component E: the LLM-provider proxy. Same dispatch engine as component
//! D (`broker_proxy_core`) but with its own admission model (spec.md
//! §4.E): a shared proxy token instead of a per-session token, clients
//! restricted to private/loopback IPs, a fixed upstream origin instead of
//! a `{host}` path segment, a four-source credential-resolution chain,
//! and single-flight OAuth2 refresh.

pub mod config;
pub mod oauth;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Json;
use broker_audit_log::DailyAuditLog;
use broker_audit_spec::{
    Actor, AuditEvent, Category, Component, Decision, EventDetail, OAuthRefreshDetail,
    ProxyRequestDetail, RequestId,
};
use broker_common::constant_time_eq;
use broker_ratelimit::RateLimiter;
use broker_vault::Credential;
use broker_vault_rpc::protocol::{Request as VaultRequest, Response as VaultResponse, ResponseOk};
use broker_vault_rpc::VaultRpcClient;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use config::Config;
use oauth::OAuthCoalescer;

#[derive(Debug, Error)]
pub enum LlmProxyError {
    #[error("missing or invalid proxy token")]
    Unauthorized,
    #[error("caller is not on a private or loopback network")]
    PeerNotAllowed,
    #[error("request path is not well-formed")]
    BadPath,
    #[error("no credential available for the upstream LLM host")]
    NoCredential,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Core(#[from] broker_proxy_core::ProxyError),
    #[error("vault unavailable: {0}")]
    VaultUnavailable(String),
}

impl LlmProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LlmProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            LlmProxyError::PeerNotAllowed => StatusCode::FORBIDDEN,
            LlmProxyError::BadPath => StatusCode::BAD_REQUEST,
            LlmProxyError::NoCredential => StatusCode::FORBIDDEN,
            LlmProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            LlmProxyError::Core(e) => e.status_code(),
            LlmProxyError::VaultUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            LlmProxyError::Unauthorized => Category::AuthDenied,
            LlmProxyError::PeerNotAllowed => Category::NetBlocked,
            LlmProxyError::BadPath => Category::InputInvalid,
            LlmProxyError::NoCredential => Category::PolicyDenied,
            LlmProxyError::RateLimited => Category::RateLimited,
            LlmProxyError::Core(e) => match e {
                broker_proxy_core::ProxyError::TooLarge(_) => Category::IoLimit,
                broker_proxy_core::ProxyError::UpstreamFailed(_) => Category::UpstreamFail,
                broker_proxy_core::ProxyError::UpstreamTimeout => Category::UpstreamTimeout,
                broker_proxy_core::ProxyError::Internal(_) => Category::BrokerBug,
            },
            LlmProxyError::VaultUnavailable(_) => Category::VaultFail,
        }
    }
}

impl IntoResponse for LlmProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

pub struct AppState {
    pub config: Config,
    pub vault: VaultRpcClient,
    pub http_client: reqwest::Client,
    pub caller_limiter: RateLimiter,
    pub oauth: OAuthCoalescer,
    pub audit: Mutex<DailyAuditLog>,
}

impl AppState {
    pub fn new(config: Config, audit_dir: impl AsRef<std::path::Path>) -> Self {
        let vault = VaultRpcClient::new(config.vault_socket_path.clone()).with_timeout(config.vault_rpc_timeout);
        Self {
            http_client: broker_proxy_core::build_upstream_client(),
            vault,
            caller_limiter: RateLimiter::with_default_window(),
            oauth: OAuthCoalescer::new(),
            audit: Mutex::new(
                DailyAuditLog::open(audit_dir).expect("audit log directory must be creatable"),
            ),
            config,
        }
    }
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/v1/llm-proxy/*rest", any(proxy_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    ok: bool,
    vault: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vault_ok = state.vault.ping().await;
    let status = if vault_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(HealthBody { ok: vault_ok, vault: vault_ok }))
}

/// True if `peer` is loopback or falls in a private (RFC1918 / ULA)
/// range. This reuses `broker_netguard`'s blocklist ranges for the
/// opposite purpose of component D/G: there, those ranges describe
/// forbidden *destinations*; here they describe the only acceptable
/// *callers* for this internal-only proxy.
fn peer_is_private_or_loopback(peer: SocketAddr) -> bool {
    broker_netguard::is_blocked_ip(peer.ip())
}

/// Percent-decodes `rest` and rejects `..`, backslashes, or a
/// double-leading-slash (spec.md §4.E "Path hygiene").
fn sanitize_path(rest: &str) -> Result<String, LlmProxyError> {
    let decoded = percent_decode(rest).ok_or(LlmProxyError::BadPath)?;
    if decoded.contains("..") || decoded.contains('\\') || decoded.starts_with("//") {
        return Err(LlmProxyError::BadPath);
    }
    Ok(decoded)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = (bytes[i + 1] as char).to_digit(16)?;
            let lo = (bytes[i + 2] as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Walks the four-source credential-resolution chain from spec.md §4.E.
async fn resolve_credential(state: &AppState, request_id: RequestId) -> Result<Credential, LlmProxyError> {
    // (1) vault api-key entry for the LLM host.
    if let Ok(VaultResponse::Ok { body: ResponseOk::Get { entry: Some(entry) }, .. }) = state
        .vault
        .call(VaultRequest::Get {
            protocol: state.config.api_key_protocol.clone(),
            target: state.config.api_key_target.clone(),
        })
        .await
    {
        return Ok(entry.credential);
    }

    // (2) vault OAuth2 secret, refreshed (single-flight) if near expiry.
    let oauth_probe = state
        .vault
        .call(VaultRequest::Get { protocol: "oauth2".into(), target: state.config.oauth_target.clone() })
        .await;
    if matches!(oauth_probe, Ok(VaultResponse::Ok { body: ResponseOk::Get { entry: Some(_) }, .. })) {
        let outcome = oauth::get_access_token(
            &state.vault,
            &state.http_client,
            &state.oauth,
            "oauth2",
            &state.config.oauth_target,
            state.config.oauth_refresh_margin,
        )
        .await;
        if let Ok(outcome) = outcome {
            let mut audit = state.audit.lock().await;
            let _ = audit.append(AuditEvent::new(
                request_id,
                Actor::agent(None),
                Component::LlmProxy,
                if outcome.fell_back_expired { Category::VaultFail } else { Category::VaultOk },
                if outcome.fell_back_expired { Decision::Error } else { Decision::Allow },
                EventDetail::OAuthRefresh(OAuthRefreshDetail {
                    protocol: "oauth2".into(),
                    target: state.config.oauth_target.clone(),
                    coalesced: outcome.coalesced,
                    latency_ms: None,
                }),
            ));
            return Ok(Credential::Bearer { token: outcome.access_token });
        }
    }

    // (3) environment-supplied token.
    if let Ok(token) = std::env::var(&state.config.env_token_var) {
        if !token.is_empty() {
            return Ok(Credential::Bearer { token });
        }
    }

    // (4) a credentials file on disk.
    if let Some(path) = &state.config.credentials_file {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Some(first_line) = contents.lines().next() {
                let token = first_line.trim();
                if !token.is_empty() {
                    return Ok(Credential::Bearer { token: token.to_string() });
                }
            }
        }
    }

    Err(LlmProxyError::NoCredential)
}

fn extract_proxy_token(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(tok) = v.strip_prefix("Bearer ") {
            return Some(tok.to_string());
        }
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request_id = RequestId::new();
    match handle_llm_request(&state, peer, method, &rest, query.as_deref(), headers, body, request_id).await {
        Ok(resp) => resp,
        Err(e) => {
            let mut audit = state.audit.lock().await;
            let _ = audit.append(AuditEvent::new(
                request_id,
                Actor::agent(None),
                Component::LlmProxy,
                e.category(),
                Decision::Deny,
                EventDetail::ProxyRequest(ProxyRequestDetail {
                    method: "?".into(),
                    host: state.config.upstream_origin.host_str().map(|h| h.to_string()),
                    path: Some(rest.clone()),
                    status: Some(e.status_code().as_u16()),
                    reason: Some(e.to_string()),
                }),
            ));
            e.into_response()
        }
    }
}

async fn handle_llm_request(
    state: &Arc<AppState>,
    peer: SocketAddr,
    method: Method,
    rest: &str,
    query: Option<&str>,
    headers: HeaderMap,
    body: Body,
    request_id: RequestId,
) -> Result<Response, LlmProxyError> {
    // Admission: proxy token + private/loopback caller only.
    let token = extract_proxy_token(&headers).ok_or(LlmProxyError::Unauthorized)?;
    if !constant_time_eq(token.as_bytes(), state.config.proxy_token.as_bytes()) {
        return Err(LlmProxyError::Unauthorized);
    }
    if !peer_is_private_or_loopback(peer) {
        return Err(LlmProxyError::PeerNotAllowed);
    }

    let clean_path = sanitize_path(rest)?;

    let caller_key = peer.ip().to_string();
    if !state.caller_limiter.check(&caller_key, state.config.default_rate_limit_per_minute) {
        return Err(LlmProxyError::RateLimited);
    }

    let credential = resolve_credential(state, request_id).await?;

    // Reconstruct the upstream URL by joining against the fixed origin —
    // this makes a `https://evil@api.vendor`-style injection impossible,
    // since `Url::join` parses `clean_path` as a path, never as a new
    // authority.
    let mut url = state
        .config
        .upstream_origin
        .join(clean_path.trim_start_matches('/'))
        .map_err(|_| LlmProxyError::BadPath)?;
    if let Some(q) = query {
        url.set_query(Some(q));
    }
    let url = broker_proxy_core::apply_query_credential(url, &credential);

    let host = state.config.upstream_origin.host_str().unwrap_or("llm-upstream").to_string();
    let upstream_headers = broker_proxy_core::build_upstream_headers(&headers, &credential, &host)?;
    let body_bytes = broker_proxy_core::read_limited_body(body, state.config.body_limit_bytes).await?;

    {
        let mut audit = state.audit.lock().await;
        let _ = audit.append(AuditEvent::new(
            request_id,
            Actor::agent(None),
            Component::LlmProxy,
            Category::UpstreamOk,
            Decision::Allow,
            EventDetail::ProxyRequest(ProxyRequestDetail {
                method: method.to_string(),
                host: Some(host.clone()),
                path: Some(clean_path.clone()),
                status: None,
                reason: None,
            }),
        ));
    }

    let resp = broker_proxy_core::dispatch_upstream(
        &state.http_client,
        method.clone(),
        url,
        upstream_headers,
        body_bytes,
        state.config.upstream_timeout,
    )
    .await?;

    let status = resp.status().as_u16();
    let (status_code, out_headers, out_body) = broker_proxy_core::stream_upstream_response(resp);

    {
        let mut audit = state.audit.lock().await;
        let _ = audit.append(AuditEvent::new(
            request_id,
            Actor::agent(None),
            Component::LlmProxy,
            Category::UpstreamOk,
            Decision::Allow,
            EventDetail::ProxyRequest(ProxyRequestDetail {
                method: method.to_string(),
                host: Some(host),
                path: Some(clean_path),
                status: Some(status),
                reason: None,
            }),
        ));
    }

    let mut builder = Response::builder().status(status_code);
    for (name, value) in out_headers.iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(out_body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_path_rejects_traversal() {
        assert!(sanitize_path("messages/../../../etc/passwd").is_err());
        assert!(sanitize_path("messages%2e%2e/x").is_err());
    }

    #[test]
    fn sanitize_path_rejects_backslash_and_double_slash() {
        assert!(sanitize_path("messages\\x").is_err());
        assert!(sanitize_path("//evil.example.com/x").is_err());
    }

    #[test]
    fn sanitize_path_allows_normal_path() {
        assert_eq!(sanitize_path("v1/messages").unwrap(), "v1/messages");
    }

    #[test]
    fn peer_restriction_allows_loopback_and_private_only() {
        assert!(peer_is_private_or_loopback("127.0.0.1:9999".parse().unwrap()));
        assert!(peer_is_private_or_loopback("10.0.0.5:9999".parse().unwrap()));
        assert!(!peer_is_private_or_loopback("8.8.8.8:9999".parse().unwrap()));
    }

    #[test]
    fn proxy_token_extraction_checks_bearer_then_api_key() {
        let mut h = HeaderMap::new();
        h.insert("authorization", "Bearer tok-1".parse().unwrap());
        assert_eq!(extract_proxy_token(&h), Some("tok-1".to_string()));

        let mut h2 = HeaderMap::new();
        h2.insert("x-api-key", "tok-2".parse().unwrap());
        assert_eq!(extract_proxy_token(&h2), Some("tok-2".to_string()));
    }
}
