//! broker_proxy_core
//!
//! Shared dispatch engine for the two credential-injecting proxies
//! (component D, the generic HTTP credential proxy, and component E, the
//! LLM provider proxy). Admission — which host/path is allowed, which
//! session or proxy token is required — differs between D and E and is
//! NOT modeled here; this crate only owns what is textually identical in
//! spec.md §4.D/§4.E once a `Credential` has been resolved: header
//! construction, the size-limited body read, the no-redirect upstream
//! dispatch, timeout/error mapping, and hop-by-hop header stripping on
//! the way back.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use broker_vault::Credential;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_USER_AGENT: &str = "security-broker-proxy/1.0";

/// Request headers the proxy forwards upstream unmodified (spec.md §4.D
/// step 7). Everything else is dropped; the credential's own auth header
/// and a fixed User-Agent are added separately.
pub const FORWARDED_REQUEST_HEADERS: &[&str] =
    &["content-type", "content-length", "accept", "accept-language"];

/// Response headers that must never be forwarded downstream because they
/// describe the hop between the broker and the upstream, not the
/// end-to-end payload (spec.md §4.D step 10).
pub const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-encoding",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body exceeds the {0} byte limit")]
    TooLarge(usize),
    #[error("upstream request failed: {0}")]
    UpstreamFailed(String),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable audit category per spec.md §7's error-kind table. Never
    /// includes the credential or the full upstream URL.
    pub fn audit_category(&self) -> &'static str {
        match self {
            ProxyError::TooLarge(_) => "io.limit",
            ProxyError::UpstreamFailed(_) => "upstream.fail",
            ProxyError::UpstreamTimeout => "upstream.timeout",
            ProxyError::Internal(_) => "broker.bug",
        }
    }
}

/// Reads `body` up to `limit` bytes, failing closed with `TooLarge` if the
/// request carries more. A buffered read (rather than a fully zero-copy
/// chained transform) is the right trade-off at the documented 10 MiB
/// default cap: it bounds memory deterministically and lets the 413 be
/// decided before any byte reaches the upstream, at the cost of not
/// forwarding the request body before it is fully received.
pub async fn read_limited_body(body: Body, limit: usize) -> Result<Vec<u8>, ProxyError> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::TooLarge(limit))?;
    Ok(bytes.to_vec())
}

/// Builds the upstream headers for a request carrying `credential`:
/// copies the forwarded allow-list from `incoming`, injects the
/// credential's auth header (query credentials are applied to the URL
/// instead, by the caller), sets a fixed `User-Agent`, and sets `Host` to
/// `host`.
pub fn build_upstream_headers(
    incoming: &HeaderMap,
    credential: &Credential,
    host: &str,
) -> Result<HeaderMap, ProxyError> {
    let mut out = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(v) = incoming.get(*name) {
            out.insert(HeaderName::from_static(name), v.clone());
        }
    }
    out.insert(
        HeaderName::from_static("user-agent"),
        HeaderValue::from_static(DEFAULT_USER_AGENT),
    );
    out.insert(
        HeaderName::from_static("host"),
        HeaderValue::from_str(host).map_err(|e| ProxyError::Internal(e.to_string()))?,
    );

    match credential {
        Credential::Bearer { token } => {
            let v = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            out.insert(HeaderName::from_static("authorization"), v);
        }
        Credential::ApiKey { header, token } => {
            let name = HeaderName::from_bytes(header.to_ascii_lowercase().as_bytes())
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            let v = HeaderValue::from_str(token).map_err(|e| ProxyError::Internal(e.to_string()))?;
            out.insert(name, v);
        }
        Credential::Basic { username, password } => {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            let raw = format!("{username}:{password}");
            let encoded = STANDARD.encode(raw.as_bytes());
            let v = HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            out.insert(HeaderName::from_static("authorization"), v);
        }
        Credential::Query { .. } => {
            // applied to the URL by the caller, not a header.
        }
        Credential::OAuth2 { access_token, .. } => {
            let v = HeaderValue::from_str(&format!("Bearer {access_token}"))
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            out.insert(HeaderName::from_static("authorization"), v);
        }
        Credential::Opaque { .. } => {
            // opaque blobs (e.g. serialized OAuth state) are not HTTP credentials.
        }
    }
    Ok(out)
}

/// Appends the `query` credential's `param=token` pair to `url` if
/// `credential` is a `Query` variant; otherwise returns `url` unchanged.
pub fn apply_query_credential(mut url: url::Url, credential: &Credential) -> url::Url {
    if let Credential::Query { param, token } = credential {
        url.query_pairs_mut().append_pair(param, token);
    }
    url
}

/// Dispatches `method url` with `headers` and `body` against `client`,
/// with automatic redirects disabled (spec.md §4.D step 9 — a 3xx must be
/// returned verbatim so credentials never leak via a redirect chain) and
/// bounded by `timeout`.
pub async fn dispatch_upstream(
    client: &reqwest::Client,
    method: Method,
    url: url::Url,
    headers: HeaderMap,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<reqwest::Response, ProxyError> {
    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(reqwest_method, url).timeout(timeout).body(body);
    for (name, value) in headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    match builder.send().await {
        Ok(resp) => Ok(resp),
        Err(e) if e.is_timeout() => Err(ProxyError::UpstreamTimeout),
        Err(e) => Err(ProxyError::UpstreamFailed(e.to_string())),
    }
}

/// Builds a `reqwest::Client` configured the way every proxy in this
/// workspace must be: redirects disabled process-wide so no call site can
/// accidentally forget step 9.
pub fn build_upstream_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("static reqwest client config is always valid")
}

/// Converts an upstream `reqwest::Response` into an axum response,
/// forwarding status and headers except the hop-by-hop set, and piping
/// the body as a stream so backpressure is preserved on the way out.
pub fn stream_upstream_response(resp: reqwest::Response) -> (StatusCode, HeaderMap, Body) {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers().iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_RESPONSE_HEADERS.iter().any(|h| *h == lower) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(n, v);
        }
    }
    let body = Body::from_stream(resp.bytes_stream());
    (status, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap as HM;

    #[test]
    fn forwarded_headers_are_copied_and_credential_injected() {
        let mut incoming = HM::new();
        incoming.insert("content-type", HeaderValue::from_static("application/json"));
        incoming.insert("x-evil", HeaderValue::from_static("drop-me"));
        let cred = Credential::ApiKey { header: "Authorization".into(), token: "sk-test".into() };
        let out = build_upstream_headers(&incoming, &cred, "api.example.com").unwrap();
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert!(out.get("x-evil").is_none());
        assert_eq!(out.get("authorization").unwrap(), "sk-test");
        assert_eq!(out.get("host").unwrap(), "api.example.com");
    }

    #[test]
    fn bearer_credential_adds_bearer_prefix() {
        let incoming = HM::new();
        let cred = Credential::Bearer { token: "tok123".into() };
        let out = build_upstream_headers(&incoming, &cred, "h").unwrap();
        assert_eq!(out.get("authorization").unwrap(), "Bearer tok123");
    }

    #[test]
    fn query_credential_is_appended_to_url_not_headers() {
        let url = url::Url::parse("https://api.example.com/v1/x").unwrap();
        let cred = Credential::Query { param: "key".into(), token: "abc".into() };
        let out = apply_query_credential(url, &cred);
        assert_eq!(out.query(), Some("key=abc"));
    }

    #[test]
    fn hop_by_hop_header_set_excludes_transfer_encoding() {
        assert!(HOP_BY_HOP_RESPONSE_HEADERS.contains(&"transfer-encoding"));
        assert!(!HOP_BY_HOP_RESPONSE_HEADERS.contains(&"content-type"));
    }
}
