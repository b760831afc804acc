//! broker_netguard
//!
//! SSRF protection shared by the HTTP/LLM proxies' admission checks
//! (4.D/4.E) and the tool-call guardrail's L1 pre-hook (4.G). Defines the
//! host grammar the proxies require, the private/link-local/metadata
//! blocklist, and an allow-list matcher that supports wildcard-prefix
//! patterns for strict network mode.

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetGuardError {
    #[error("host fails grammar check: {0}")]
    BadHostGrammar(String),
    #[error("host resolves to a blocked address: {0}")]
    BlockedHost(String),
    #[error("host is not on the operator allow-list: {0}")]
    NotAllowed(String),
}

static HOST_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)[a-z0-9](?:[a-z0-9.\-]*[a-z0-9])?(?::\d{1,5})?$").unwrap()
});

/// The operator-visible metadata/internal hostnames that must never be
/// reachable through the proxy, regardless of what they currently resolve
/// to (DNS rebinding defense-in-depth).
pub const BLOCKED_HOSTNAMES: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "kubernetes.default.svc",
    "100.100.100.200",
];

/// Validate the `{host}` path segment grammar from spec.md §4.D step 2:
/// must match the host/port grammar and contain a dot, except for
/// `localhost[:PORT]`. Rejects user-info, whitespace, and percent-encoding
/// in the host segment.
pub fn validate_host_grammar(host: &str) -> Result<(), NetGuardError> {
    if host.contains('@') || host.contains('%') || host.chars().any(|c| c.is_whitespace()) {
        return Err(NetGuardError::BadHostGrammar(host.to_string()));
    }
    if !HOST_GRAMMAR.is_match(host) {
        return Err(NetGuardError::BadHostGrammar(host.to_string()));
    }
    let host_without_port = host.split(':').next().unwrap_or(host);
    let is_localhost = host_without_port.eq_ignore_ascii_case("localhost");
    if !is_localhost && !host_without_port.contains('.') {
        return Err(NetGuardError::BadHostGrammar(host.to_string()));
    }
    Ok(())
}

/// True if `ip` falls in a private, link-local, loopback, or
/// cloud-metadata range (spec.md §4.G L1 blocked-host set).
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_loopback() // 127.0.0.0/8
        || o[0] == 10 // 10/8
        || (o[0] == 172 && (16..=31).contains(&o[1])) // 172.16/12
        || (o[0] == 192 && o[1] == 168) // 192.168/16
        || (o[0] == 169 && o[1] == 254) // 169.254/16 (link-local / AWS IMDS)
        || ip == Ipv4Addr::new(100, 100, 100, 200) // Alibaba metadata
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true; // ::1
    }
    let seg = ip.segments();
    if seg[0] & 0xffc0 == 0xfe80 {
        return true; // fe80::/10
    }
    if seg[0] & 0xfe00 == 0xfc00 {
        return true; // fc00::/7
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    false
}

/// Classifies a host string (which may already be a literal IP) against
/// the static blocklist, without DNS resolution.
pub fn is_blocked_host_literal(host: &str) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    if BLOCKED_HOSTNAMES.iter().any(|h| h.eq_ignore_ascii_case(bare)) {
        return true;
    }
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return is_blocked_ip(ip);
    }
    false
}

/// Resolves `host:port` (or `host` with `default_port`) and rejects if any
/// resolved address is blocked. This is the real SSRF defense — a
/// hostname that looks benign can still resolve to a private address.
pub async fn resolve_and_check(host: &str, default_port: u16) -> Result<Vec<SocketAddr>, NetGuardError> {
    if is_blocked_host_literal(host) {
        return Err(NetGuardError::BlockedHost(host.to_string()));
    }
    let lookup_target = if host.contains(':') { host.to_string() } else { format!("{host}:{default_port}") };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&lookup_target)
        .await
        .map_err(|_| NetGuardError::BlockedHost(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(NetGuardError::BlockedHost(host.to_string()));
    }
    if addrs.iter().any(|a| is_blocked_ip(a.ip())) {
        return Err(NetGuardError::BlockedHost(host.to_string()));
    }
    Ok(addrs)
}

/// Operator allow-list with wildcard-prefix support: a pattern of
/// `*.example.com` matches any subdomain of `example.com` (but not
/// `example.com` itself); a bare pattern matches exactly.
pub fn host_allowed(host: &str, patterns: &[String]) -> bool {
    let bare = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    patterns.iter().any(|p| {
        let p = p.to_ascii_lowercase();
        if let Some(suffix) = p.strip_prefix("*.") {
            bare.ends_with(suffix) && bare.len() > suffix.len() && bare.as_bytes()[bare.len() - suffix.len() - 1] == b'.'
        } else {
            bare == p
        }
    })
}

/// `NETWORK_MODE` as configured for the tool-call guardrail's L1 web-fetch
/// check (spec.md §4.G, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Strict,
    Permissive,
    Open,
}

impl std::str::FromStr for NetworkMode {
    type Err = NetGuardError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            "open" => Ok(Self::Open),
            other => Err(NetGuardError::BadHostGrammar(format!("unknown NETWORK_MODE: {other}"))),
        }
    }
}

/// Combines the blocked-domain list, operator allow-list, and
/// `NETWORK_MODE` into a single admission decision for a web-fetch host.
/// The private/link-local/metadata blocklist (`is_blocked_host_literal`)
/// is never bypassable by `NETWORK_MODE`; only the allow-list requirement
/// is. `NETWORK_MODE=open` is a deliberate, explicit bypass of the
/// allow-list requirement — see the Open Question in spec.md §9 — not a
/// silent clamp back to the default allow-list.
pub fn network_mode_permits(
    host: &str,
    mode: NetworkMode,
    blocked_domains: &[String],
    additional_domains: &[String],
) -> bool {
    if is_blocked_host_literal(host) {
        return false;
    }
    if !blocked_domains.is_empty() && host_allowed(host, blocked_domains) {
        return false;
    }
    match mode {
        NetworkMode::Open | NetworkMode::Permissive => true,
        NetworkMode::Strict => host_allowed(host, additional_domains),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_rejects_userinfo_and_percent() {
        assert!(validate_host_grammar("user@api.example.com").is_err());
        assert!(validate_host_grammar("api.example.com%0a").is_err());
    }

    #[test]
    fn grammar_requires_dot_unless_localhost() {
        assert!(validate_host_grammar("api.example.com").is_ok());
        assert!(validate_host_grammar("localhost:8080").is_ok());
        assert!(validate_host_grammar("noTLD").is_err());
    }

    #[test]
    fn blocks_loopback_and_private_v4() {
        assert!(is_blocked_ip("127.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("10.0.0.5".parse().unwrap()));
        assert!(is_blocked_ip("172.16.0.1".parse().unwrap()));
        assert!(is_blocked_ip("192.168.1.1".parse().unwrap()));
        assert!(is_blocked_ip("169.254.169.254".parse().unwrap()));
        assert!(!is_blocked_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn blocks_link_local_and_unique_local_v6() {
        assert!(is_blocked_ip("::1".parse().unwrap()));
        assert!(is_blocked_ip("fe80::1".parse().unwrap()));
        assert!(is_blocked_ip("fc00::1".parse().unwrap()));
        assert!(!is_blocked_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn blocks_metadata_hostnames() {
        assert!(is_blocked_host_literal("metadata.google.internal"));
        assert!(is_blocked_host_literal("100.100.100.200"));
        assert!(!is_blocked_host_literal("api.openai.com"));
    }

    #[test]
    fn wildcard_allowlist_matches_subdomains_only() {
        let patterns = vec!["*.example.com".to_string()];
        assert!(host_allowed("api.example.com", &patterns));
        assert!(!host_allowed("example.com", &patterns));
        assert!(!host_allowed("evilexample.com", &patterns));
    }

    #[test]
    fn strict_mode_requires_allowlist_permissive_does_not() {
        let additional = vec!["api.example.com".to_string()];
        assert!(network_mode_permits("api.example.com", NetworkMode::Strict, &[], &additional));
        assert!(!network_mode_permits("other.example.com", NetworkMode::Strict, &[], &additional));
        assert!(network_mode_permits("other.example.com", NetworkMode::Permissive, &[], &additional));
    }

    #[test]
    fn open_mode_bypasses_allowlist_but_never_the_metadata_blocklist() {
        assert!(network_mode_permits("anything.example.com", NetworkMode::Open, &[], &[]));
        assert!(!network_mode_permits("169.254.169.254", NetworkMode::Open, &[], &[]));
        assert!(!network_mode_permits("metadata.google.internal", NetworkMode::Open, &[], &[]));
    }

    #[test]
    fn blocked_domains_override_even_strict_allowlist() {
        let additional = vec!["evil.example.com".to_string()];
        let blocked = vec!["evil.example.com".to_string()];
        assert!(!network_mode_permits("evil.example.com", NetworkMode::Strict, &blocked, &additional));
    }
}
