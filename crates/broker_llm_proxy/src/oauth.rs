//! Single-flight OAuth2 access-token refresh for component E.
//!
//! At most one HTTP POST to a given `(protocol, target)`'s refresh
//! endpoint is ever in flight process-wide (spec.md §4.E, §5, and the
//! testable property in §8). Concurrent callers that observe an expiring
//! token join the one in-flight refresh rather than each firing their own
//! request at the (single-use) refresh token.

use broker_vault::Credential;
use broker_vault_rpc::protocol::{Request as VaultRequest, Response as VaultResponse, ResponseOk};
use broker_vault_rpc::VaultRpcClient;
use futures::future::{FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EXPIRES_IN_SECS: f64 = 3600.0;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("no oauth2 credential configured for {0}")]
    NotFound(String),
    #[error("vault unavailable: {0}")]
    VaultUnavailable(String),
}

type RefreshOutcome = Result<String, String>;
type RefreshFuture = Shared<Pin<Box<dyn Future<Output = RefreshOutcome> + Send>>>;

/// Outcome of a `get_access_token` call, carrying enough detail for the
/// caller to emit an accurate `OAuthRefreshDetail` audit event.
#[derive(Debug, Clone)]
pub struct TokenOutcome {
    pub access_token: String,
    pub refreshed: bool,
    pub coalesced: bool,
    pub fell_back_expired: bool,
}

/// Process-wide refresh coalescer keyed by `"{protocol}:{target}"` — the
/// same key the vault uses for the underlying entry.
#[derive(Default)]
pub struct OAuthCoalescer {
    inflight: Mutex<HashMap<String, RefreshFuture>>,
}

impl OAuthCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_inflight(&self, key: &str) -> bool {
        self.inflight.lock().await.contains_key(key)
    }

    /// Runs `do_refresh` for `key` unless a refresh for the same key is
    /// already in flight, in which case this call awaits that one
    /// instead of starting a second HTTP POST.
    pub async fn refresh_or_join<F, Fut>(&self, key: &str, do_refresh: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let mut guard = self.inflight.lock().await;
        if let Some(existing) = guard.get(key) {
            let fut = existing.clone();
            drop(guard);
            return fut.await;
        }
        let fut: RefreshFuture = do_refresh().boxed().shared();
        guard.insert(key.to_string(), fut.clone());
        drop(guard);

        let result = fut.await;
        self.inflight.lock().await.remove(key);
        result
    }
}

async fn fetch_oauth_entry(
    vault: &VaultRpcClient,
    protocol: &str,
    target: &str,
) -> Result<broker_vault::CredentialEntry, OAuthError> {
    match vault.call(VaultRequest::Get { protocol: protocol.to_string(), target: target.to_string() }).await {
        Ok(VaultResponse::Ok { body: ResponseOk::Get { entry: Some(entry) }, .. }) => Ok(entry),
        Ok(VaultResponse::Ok { body: ResponseOk::Get { entry: None }, .. }) => {
            Err(OAuthError::NotFound(format!("{protocol}:{target}")))
        }
        Ok(VaultResponse::Err { error, .. }) => Err(OAuthError::VaultUnavailable(error)),
        Ok(_) => Err(OAuthError::VaultUnavailable("unexpected vault response".into())),
        Err(e) => Err(OAuthError::VaultUnavailable(e.to_string())),
    }
}

#[derive(serde::Deserialize)]
struct RefreshResponseBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<f64>,
}

/// Performs the actual refresh-token grant POST and persists the result
/// back to the vault. This is the closure body handed to
/// `OAuthCoalescer::refresh_or_join` — it runs at most once per
/// coalesced group.
async fn perform_refresh(
    http: reqwest::Client,
    vault: VaultRpcClient,
    protocol: String,
    target: String,
) -> RefreshOutcome {
    let entry = fetch_oauth_entry(&vault, &protocol, &target)
        .await
        .map_err(|e| e.to_string())?;

    let (refresh_token, refresh_url, client_id, scopes) = match &entry.credential {
        Credential::OAuth2 { refresh_token, refresh_url, client_id, scopes, .. } => {
            (refresh_token.clone(), refresh_url.clone(), client_id.clone(), scopes.clone())
        }
        other => return Err(format!("{} is not an oauth2 credential", other.type_name())),
    };

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token.as_str()),
        ("client_id", client_id.as_str()),
    ];
    let resp = http
        .post(&refresh_url)
        .form(&form)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| format!("refresh request failed: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("refresh endpoint returned {}", resp.status().as_u16()));
    }

    let body: RefreshResponseBody =
        resp.json().await.map_err(|e| format!("refresh response parse failed: {e}"))?;

    let new_expires_at = broker_common::now_unix_secs_f64() + body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let new_credential = Credential::OAuth2 {
        access_token: body.access_token.clone(),
        // The refresh token is single-use for many providers; if the
        // response omits a new one, keep the old one rather than
        // inventing a rotation that didn't happen.
        refresh_token: body.refresh_token.unwrap_or(refresh_token),
        expires_at: new_expires_at,
        scopes,
        refresh_url,
        client_id,
    };

    let store_req = VaultRequest::Store {
        protocol,
        target,
        credential: new_credential,
        label: entry.label,
        allowed_paths: entry.allowed_paths,
        rate_limit_per_minute: entry.rate_limit_per_minute,
        expires_at: entry.expires_at,
    };
    match vault.call(store_req).await {
        Ok(VaultResponse::Ok { .. }) => Ok(body.access_token),
        Ok(VaultResponse::Err { error, .. }) => Err(format!("failed to persist refreshed token: {error}")),
        _ => Err("failed to persist refreshed token".to_string()),
    }
}

/// Returns a usable access token for `(protocol, target)`, refreshing it
/// (through the single-flight coalescer) if it is within `margin` of
/// expiry. On refresh failure, falls back to the last known token and
/// reports `fell_back_expired = true` so the caller can log it and retry
/// on the next request (spec.md §7 "Recovery").
pub async fn get_access_token(
    vault: &VaultRpcClient,
    http: &reqwest::Client,
    coalescer: &OAuthCoalescer,
    protocol: &str,
    target: &str,
    margin: Duration,
) -> Result<TokenOutcome, OAuthError> {
    let entry = fetch_oauth_entry(vault, protocol, target).await?;
    let (access_token, expires_at) = match entry.credential {
        Credential::OAuth2 { access_token, expires_at, .. } => (access_token, expires_at),
        _ => return Err(OAuthError::NotFound(format!("{protocol}:{target}"))),
    };

    let now = broker_common::now_unix_secs_f64();
    if expires_at - now > margin.as_secs_f64() {
        return Ok(TokenOutcome { access_token, refreshed: false, coalesced: false, fell_back_expired: false });
    }

    let key = format!("{protocol}:{target}");
    let already_inflight = coalescer.is_inflight(&key).await;
    let http_owned = http.clone();
    let vault_owned = vault.clone();
    let protocol_owned = protocol.to_string();
    let target_owned = target.to_string();

    let result = coalescer
        .refresh_or_join(&key, move || perform_refresh(http_owned, vault_owned, protocol_owned, target_owned))
        .await;

    match result {
        Ok(new_token) => {
            Ok(TokenOutcome { access_token: new_token, refreshed: true, coalesced: already_inflight, fell_back_expired: false })
        }
        Err(_reason) => {
            Ok(TokenOutcome { access_token, refreshed: false, coalesced: already_inflight, fell_back_expired: true })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_callers_join_a_single_refresh() {
        let coalescer = Arc::new(OAuthCoalescer::new());
        let call_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let coalescer = coalescer.clone();
            let call_count = call_count.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .refresh_or_join("oauth2:anthropic", move || {
                        let call_count = call_count.clone();
                        async move {
                            call_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok("new-access-token".to_string())
                        }
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|t| t == "new-access-token"));
    }

    #[tokio::test]
    async fn sequential_refreshes_after_completion_run_again() {
        let coalescer = OAuthCoalescer::new();
        let call_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let call_count = call_count.clone();
            coalescer
                .refresh_or_join("oauth2:anthropic", move || async move {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    Ok("token".to_string())
                })
                .await
                .unwrap();
        }

        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }
}
