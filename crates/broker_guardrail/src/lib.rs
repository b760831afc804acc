//! broker_guardrail
//!
//! Tool-call guardrail (component G): a permission-tier gate, an
//! unconditional L1 pre-hook, and a policy-tier L2 `can_use_tool` check,
//! composed into a single `GuardrailEngine`. Mirrors the "auth hook
//! returning a discriminated result" shape from spec.md §9 — callers get
//! back `Decision::Allow | Deny{reason} | Modify{input}` rather than a
//! bare bool, so a denial always carries the reason into the audit log.

mod bash_guard;
mod sensitive_path;
mod tiers;

pub use sensitive_path::{is_sensitive_path, is_sensitive_path_str};
pub use tiers::{tier_allows_tool, PermissionTier, TIER_TOOLS};

use broker_netguard::NetworkMode;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
    Modify { input: Value },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub network_mode: NetworkMode,
    pub blocked_domains: Vec<String>,
    pub additional_domains: Vec<String>,
    pub broker_data_dir: PathBuf,
}

/// Tool names recognized as performing an outbound web fetch, subject to
/// the L1 SSRF pre-hook.
const WEB_FETCH_TOOLS: &[&str] = &["WebFetch", "webfetch", "web_fetch"];

/// Tool names whose path argument gets the L2 sensitive-path check beyond
/// the generic string walk.
const PATH_AWARE_TOOLS: &[&str] = &["Read", "Write", "Glob", "Grep"];

pub struct GuardrailEngine {
    config: GuardrailConfig,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    /// Permission-tier gate followed by the L1 pre-hook. Denied before L1
    /// runs if the tool isn't in `tier`'s declared surface (spec.md §4.G
    /// "Permission-tier gate").
    pub fn pre_hook(&self, tier: PermissionTier, tool: &str, input: &Value) -> Decision {
        if !tier_allows_tool(tier, tool) {
            return Decision::Deny { reason: format!("{tool} is not in the {tier} tool surface") };
        }
        self.l1_pre_hook(tool, input)
    }

    /// Unconditional L1 pre-hook: for web-fetch tools, validates the URL
    /// scheme and host against the SSRF blocklist/allow-list. A no-op for
    /// every other tool.
    pub fn l1_pre_hook(&self, tool: &str, input: &Value) -> Decision {
        if !WEB_FETCH_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(tool)) {
            return Decision::Allow;
        }
        match self.check_web_fetch_url(input) {
            Ok(()) => Decision::Allow,
            Err(reason) => Decision::Deny { reason },
        }
    }

    fn check_web_fetch_url(&self, input: &Value) -> Result<(), String> {
        let url_str = input.get("url").and_then(|v| v.as_str()).ok_or_else(|| "missing url".to_string())?;
        let url = url::Url::parse(url_str).map_err(|_| format!("invalid url: {url_str}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("scheme {} is not http(s)", url.scheme()));
        }
        let host = url.host_str().ok_or_else(|| "url has no host".to_string())?;
        if !broker_netguard::network_mode_permits(
            host,
            self.config.network_mode,
            &self.config.blocked_domains,
            &self.config.additional_domains,
        ) {
            return Err(format!("host {host} is blocked or not on the operator allow-list"));
        }
        Ok(())
    }

    /// L2 `canUseTool`: the generic sensitive-path walk over every string
    /// in `input`, path-aware checks for `Read/Write/Glob/Grep`, and the
    /// Bash command block-list. Only meaningful to call after `pre_hook`
    /// has already allowed the call.
    pub fn can_use_tool(&self, tool: &str, input: &Value) -> Decision {
        if let Some(hit) = self.scan_for_sensitive_paths(input) {
            return Decision::Deny { reason: format!("sensitive path referenced: {hit}") };
        }

        if PATH_AWARE_TOOLS.contains(&tool) {
            if let Some(path_str) =
                input.get("path").or_else(|| input.get("file_path")).or_else(|| input.get("pattern")).and_then(|v| v.as_str())
            {
                if is_sensitive_path(Path::new(path_str), &self.config.broker_data_dir) {
                    return Decision::Deny { reason: format!("sensitive path: {path_str}") };
                }
            }
        }

        if tool == "Bash" {
            if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
                if let Some(reason) = bash_guard::find_blocked_pattern(command) {
                    return Decision::Deny { reason: format!("blocked command pattern: {reason}") };
                }
            }
        }

        Decision::Allow
    }

    fn scan_for_sensitive_paths(&self, input: &Value) -> Option<String> {
        fn walk(v: &Value, data_dir: &Path) -> Option<String> {
            match v {
                Value::String(s) => is_sensitive_path_str(s, data_dir).then(|| s.clone()),
                Value::Array(arr) => arr.iter().find_map(|e| walk(e, data_dir)),
                Value::Object(map) => map.values().find_map(|e| walk(e, data_dir)),
                _ => None,
            }
        }
        walk(input, &self.config.broker_data_dir)
    }
}
