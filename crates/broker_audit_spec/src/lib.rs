//! broker_audit_spec
//!
//! Strongly-typed audit events for every security-mediating component.
//! Mirrors the broker's decision points:
//! - vault store/rpc access
//! - session token issuance/validation
//! - http + llm proxy admission/dispatch
//! - attachment interception
//! - tool-call guardrail decisions
//! - output guard redactions
//! - external-content envelope wrapping
//!
//! `AuditEvent` is the generic envelope the data model specifies
//! (ts/request_id/actor/component/category/decision/detail); `EventDetail`
//! carries the component-specific, strongly-typed payload. schema_version
//! increments are per-detail-variant, not global.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Vault,
    VaultRpc,
    Session,
    HttpProxy,
    LlmProxy,
    Attachments,
    Guardrail,
    OutputGuard,
    Envelope,
    RateLimit,
}

/// Stable log category, matching spec.md's error-kind -> category table
/// plus the "ok" counterparts for successful decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    AuthDenied,
    NetBlocked,
    PolicyDenied,
    RateLimited,
    IoLimit,
    InputInvalid,
    UpstreamFail,
    UpstreamTimeout,
    UpstreamOk,
    VaultFail,
    VaultOk,
    BrokerBug,
    SecretRedacted,
    ContentWrapped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// e.g. "agent", "operator", loopback pid if known
    pub subsystem: String,
    pub session_id: Option<String>,
}

impl Actor {
    pub fn agent(session_id: Option<String>) -> Self {
        Self { subsystem: "agent".into(), session_id }
    }

    pub fn operator() -> Self {
        Self { subsystem: "operator".into(), session_id: None }
    }

    pub fn loopback() -> Self {
        Self { subsystem: "loopback".into(), session_id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultAccessDetail {
    pub op: String, // "get" | "store" | "delete" | "list" | "get-token" | "get-secret"
    pub protocol: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthRefreshDetail {
    pub protocol: String,
    pub target: String,
    pub coalesced: bool, // true if this caller waited on an in-flight refresh
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequestDetail {
    pub method: String,
    pub host: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDetail {
    pub provider_id: Option<String>,
    pub attachment_ref: Option<String>,
    pub size_bytes: Option<u64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailDetail {
    pub tool: String,
    pub tier: String,
    pub layer: String, // "l1" | "l2" | "tier_gate"
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputGuardDetail {
    pub pattern: Option<String>,
    pub entropy_flagged: bool,
    pub sink: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeDetail {
    pub source: String,
    pub service_id: String,
    pub risk_level: String,
    pub homoglyph_folded: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDetail {
    pub key: String,
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    VaultAccess(VaultAccessDetail),
    OAuthRefresh(OAuthRefreshDetail),
    Session(SessionDetail),
    ProxyRequest(ProxyRequestDetail),
    Attachment(AttachmentDetail),
    Guardrail(GuardrailDetail),
    OutputGuard(OutputGuardDetail),
    Envelope(EnvelopeDetail),
    RateLimit(RateLimitDetail),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub schema_version: u8,
    pub ts: f64,
    pub request_id: RequestId,
    pub actor: Actor,
    pub component: Component,
    pub category: Category,
    pub decision: Decision,
    pub detail: EventDetail,
}

impl AuditEvent {
    pub fn new(
        request_id: RequestId,
        actor: Actor,
        component: Component,
        category: Category,
        decision: Decision,
        detail: EventDetail,
    ) -> Self {
        Self {
            schema_version: 1,
            ts: broker_common::now_unix_secs_f64(),
            request_id,
            actor,
            component,
            category,
            decision,
            detail,
        }
    }
}
