//! broker_http_proxy
//!
//! Component D: the generic HTTP credential proxy. Rewrites
//! `http://broker/{host}/{rest}` into `https://{host}/{rest}` with
//! credentials injected from the vault (via the component B RPC socket),
//! enforcing the host grammar, per-host credential lookup, path
//! allow-lists, and both rate limits from spec.md §4.D. Dispatch itself
//! (headers, size cap, no-redirect call, response streaming) is shared
//! with component E via `broker_proxy_core`.

pub mod config;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Json;
use broker_audit_log::DailyAuditLog;
use broker_audit_spec::{
    Actor, AuditEvent, Category, Component, Decision, EventDetail, ProxyRequestDetail, RequestId,
};
use broker_ratelimit::RateLimiter;
use broker_session::SessionSigner;
use broker_vault_rpc::{protocol::Request as VaultRequest, protocol::Response as VaultResponse, VaultRpcClient};
use regex::Regex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use config::Config;

#[derive(Debug, Error)]
pub enum ProxyApiError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("missing or invalid session")]
    Unauthorized,
    #[error("no credential configured for host")]
    ForbiddenHost,
    #[error("path is not on the credential's allow-list")]
    ForbiddenPath,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Core(#[from] broker_proxy_core::ProxyError),
    #[error("vault unavailable")]
    VaultUnavailable,
}

impl ProxyApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyApiError::ForbiddenHost | ProxyApiError::ForbiddenPath => StatusCode::FORBIDDEN,
            ProxyApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyApiError::Core(e) => e.status_code(),
            ProxyApiError::VaultUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            ProxyApiError::BadRequest(_) => Category::InputInvalid,
            ProxyApiError::Unauthorized => Category::AuthDenied,
            ProxyApiError::ForbiddenHost => Category::NetBlocked,
            ProxyApiError::ForbiddenPath => Category::PolicyDenied,
            ProxyApiError::RateLimited => Category::RateLimited,
            ProxyApiError::Core(e) => match e {
                broker_proxy_core::ProxyError::TooLarge(_) => Category::IoLimit,
                broker_proxy_core::ProxyError::UpstreamFailed(_) => Category::UpstreamFail,
                broker_proxy_core::ProxyError::UpstreamTimeout => Category::UpstreamTimeout,
                broker_proxy_core::ProxyError::Internal(_) => Category::BrokerBug,
            },
            ProxyApiError::VaultUnavailable => Category::VaultFail,
        }
    }
}

impl IntoResponse for ProxyApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}

pub struct AppState {
    pub config: Config,
    pub vault: VaultRpcClient,
    pub session_signer: SessionSigner,
    pub http_client: reqwest::Client,
    pub session_limiter: RateLimiter,
    pub credential_limiter: RateLimiter,
    pub audit: Mutex<DailyAuditLog>,
}

impl AppState {
    pub fn new(config: Config, audit_dir: impl AsRef<std::path::Path>) -> Self {
        let session_signer = SessionSigner::new(config.session_signing_key.clone());
        let vault = VaultRpcClient::new(config.vault_socket_path.clone()).with_timeout(config.vault_rpc_timeout);
        Self {
            http_client: broker_proxy_core::build_upstream_client(),
            vault,
            session_signer,
            session_limiter: RateLimiter::with_default_window(),
            credential_limiter: RateLimiter::with_default_window(),
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
        .route("/hosts", get(hosts_handler))
        .route("/:host/*rest", any(proxy_handler))
        .route("/:host", any(proxy_handler_no_rest))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    ok: bool,
    vault: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vault_ok = state.vault.call(VaultRequest::Ping).await.is_ok();
    let ok = vault_ok;
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(HealthBody { ok, vault: vault_ok }))
}

async fn hosts_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.config.expose_hosts_endpoint {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.vault.call(VaultRequest::List { protocol: Some("http".into()) }).await {
        Ok(VaultResponse::Ok { body: broker_vault_rpc::protocol::ResponseOk::List { entries }, .. }) => {
            Json(entries).into_response()
        }
        _ => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn proxy_handler_no_rest(
    state: State<Arc<AppState>>,
    connect_info: ConnectInfo<SocketAddr>,
    method: Method,
    Path(host): Path<String>,
    query: RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    proxy_inner(state, connect_info, method, host, String::new(), query, headers, body).await
}

async fn proxy_handler(
    state: State<Arc<AppState>>,
    connect_info: ConnectInfo<SocketAddr>,
    method: Method,
    Path((host, rest)): Path<(String, String)>,
    query: RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    proxy_inner(state, connect_info, method, host, rest, query, headers, body).await
}

async fn proxy_inner(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    host: String,
    rest: String,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request_id = RequestId::new();
    match handle_proxy_request(&state, peer, method, &host, &rest, query.as_deref(), headers, body, request_id)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            let mut audit = state.audit.lock().await;
            let _ = audit.append(AuditEvent::new(
                request_id,
                Actor::agent(None),
                Component::HttpProxy,
                e.category(),
                Decision::Deny,
                EventDetail::ProxyRequest(ProxyRequestDetail {
                    method: "?".into(),
                    host: Some(host.clone()),
                    path: Some(rest.clone()),
                    status: Some(e.status_code().as_u16()),
                    reason: Some(e.to_string()),
                }),
            ));
            e.into_response()
        }
    }
}

async fn handle_proxy_request(
    state: &Arc<AppState>,
    peer: SocketAddr,
    method: Method,
    host: &str,
    rest: &str,
    query: Option<&str>,
    headers: HeaderMap,
    body: Body,
    request_id: RequestId,
) -> Result<Response, ProxyApiError> {
    // Step 1: classify the peer. Loopback bypasses the session check.
    let is_loopback = peer.ip().is_loopback();
    let session_header = headers.get("x-session").and_then(|v| v.to_str().ok());
    let session_id = if is_loopback && broker_session::is_relay_local_session(session_header, true) {
        broker_session::RELAY_LOCAL_SESSION_ID.to_string()
    } else if is_loopback {
        session_header.unwrap_or("loopback").to_string()
    } else {
        let token = session_header.ok_or(ProxyApiError::Unauthorized)?;
        let payload = state.session_signer.validate(token).ok_or(ProxyApiError::Unauthorized)?;
        payload.session_id
    };

    // Step 2: host grammar.
    broker_netguard::validate_host_grammar(host)
        .map_err(|e| ProxyApiError::BadRequest(e.to_string()))?;

    // Step 3: vault lookup.
    let entry = match state.vault.call(VaultRequest::Get { protocol: "http".into(), target: host.to_string() }).await {
        Ok(VaultResponse::Ok { body: broker_vault_rpc::protocol::ResponseOk::Get { entry }, .. }) => {
            entry.ok_or(ProxyApiError::ForbiddenHost)?
        }
        Ok(VaultResponse::Err { .. }) => return Err(ProxyApiError::VaultUnavailable),
        Ok(_) => return Err(ProxyApiError::VaultUnavailable),
        Err(_) => return Err(ProxyApiError::VaultUnavailable),
    };

    // Step 4: path allow-list.
    if let Some(patterns) = &entry.allowed_paths {
        let path_with_slash = format!("/{rest}");
        let allowed = patterns.iter().any(|p| {
            Regex::new(p).map(|re| re.is_match(&path_with_slash)).unwrap_or(false)
        });
        if !allowed {
            return Err(ProxyApiError::ForbiddenPath);
        }
    }

    // Step 5: rate limits.
    let session_limit = state.config.default_rate_limit_per_minute;
    if !state.session_limiter.check(&session_id, session_limit) {
        return Err(ProxyApiError::RateLimited);
    }
    let credential_key = format!("http:{host}");
    let credential_limit = entry.rate_limit_per_minute.unwrap_or(state.config.default_rate_limit_per_minute);
    if !state.credential_limiter.check(&credential_key, credential_limit) {
        return Err(ProxyApiError::RateLimited);
    }

    // Step 6: build the upstream URL.
    let query_suffix = query.map(|q| format!("?{q}")).unwrap_or_default();
    let base = format!("https://{host}/{rest}{query_suffix}");
    let url = url::Url::parse(&base).map_err(|e| ProxyApiError::BadRequest(e.to_string()))?;
    let url = broker_proxy_core::apply_query_credential(url, &entry.credential);

    // Step 7: headers.
    let upstream_headers = broker_proxy_core::build_upstream_headers(&headers, &entry.credential, host)?;

    // Step 8: size-limited body read.
    let body_bytes = broker_proxy_core::read_limited_body(body, state.config.body_limit_bytes).await?;

    // Audit: emitted before the upstream call is dispatched (spec.md §5 ordering).
    {
        let mut audit = state.audit.lock().await;
        let _ = audit.append(AuditEvent::new(
            request_id,
            Actor::agent(Some(session_id.clone())),
            Component::HttpProxy,
            Category::UpstreamOk,
            Decision::Allow,
            EventDetail::ProxyRequest(ProxyRequestDetail {
                method: method.to_string(),
                host: Some(host.to_string()),
                path: Some(format!("/{rest}")),
                status: None,
                reason: None,
            }),
        ));
    }

    // Step 9: dispatch, no redirects, bounded by timeout.
    let resp = broker_proxy_core::dispatch_upstream(
        &state.http_client,
        method.clone(),
        url,
        upstream_headers,
        body_bytes,
        state.config.upstream_timeout,
    )
    .await?;

    // Step 10: stream the response back, stripping hop-by-hop headers.
    let status = resp.status().as_u16();
    let (status_code, out_headers, out_body) = broker_proxy_core::stream_upstream_response(resp);

    {
        let mut audit = state.audit.lock().await;
        let _ = audit.append(AuditEvent::new(
            request_id,
            Actor::agent(Some(session_id)),
            Component::HttpProxy,
            Category::UpstreamOk,
            Decision::Allow,
            EventDetail::ProxyRequest(ProxyRequestDetail {
                method: method.to_string(),
                host: Some(host.to_string()),
                path: Some(format!("/{rest}")),
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
    fn error_status_mapping_matches_spec_table() {
        assert_eq!(ProxyApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyApiError::ForbiddenHost.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyApiError::ForbiddenPath.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyApiError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ProxyApiError::VaultUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyApiError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn category_mapping_matches_spec_table() {
        assert_eq!(ProxyApiError::Unauthorized.category(), Category::AuthDenied);
        assert_eq!(ProxyApiError::ForbiddenHost.category(), Category::NetBlocked);
        assert_eq!(ProxyApiError::ForbiddenPath.category(), Category::PolicyDenied);
        assert_eq!(ProxyApiError::RateLimited.category(), Category::RateLimited);
    }
}
