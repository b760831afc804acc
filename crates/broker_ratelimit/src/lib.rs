//! broker_ratelimit
//!
//! Fixed-window rate limiters (component K), shared by the HTTP credential
//! proxy (D), the LLM proxy (E), and the tool-call guardrail (G). Each
//! caller owns its own `RateLimiter` instance keyed by whatever string it
//! chooses — session id, credential storage key, tool name.
//!
//! Window = 60s, as specified. The critical section per `check()` call is
//! a single hash-map lookup/insert; no I/O happens under the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    window: Duration,
    counters: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window, counters: Mutex::new(HashMap::new()) }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW)
    }

    /// Returns true if `key` is still within `limit` requests for the
    /// current window, consuming one unit of quota if so. Missing keys
    /// are treated as a fresh, empty window (first hit creates it).
    pub fn check(&self, key: &str, limit: u32) -> bool {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry(key.to_string()).or_insert_with(|| Window { started_at: now, count: 0 });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Remove windows whose last reset predates `max_age`. Intended to run
    /// periodically from a background task so the map does not grow
    /// unboundedly under a high-cardinality key space (e.g. per-session
    /// keys for sessions that have since expired).
    pub fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.retain(|_, w| now.duration_since(w.started_at) < max_age);
    }

    pub fn len(&self) -> usize {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns a background task that calls `sweep` every `interval` with a
/// `max_age` of `2 * window`, so stale per-session/per-credential windows
/// do not accumulate forever.
pub fn spawn_sweeper(limiter: std::sync::Arc<RateLimiter>, interval: Duration, window: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.sweep(window * 2);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(rl.check("k", 5));
        }
        assert!(!rl.check("k", 5));
    }

    #[test]
    fn missing_key_starts_fresh() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        assert!(rl.check("new-key", 1));
    }

    #[test]
    fn window_resets_after_expiry() {
        let rl = RateLimiter::new(Duration::from_millis(20));
        assert!(rl.check("k", 1));
        assert!(!rl.check("k", 1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check("k", 1));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let rl = RateLimiter::new(Duration::from_secs(60));
        assert!(rl.check("a", 1));
        assert!(rl.check("b", 1));
        assert!(!rl.check("a", 1));
    }

    #[test]
    fn sweep_evicts_stale_windows() {
        let rl = RateLimiter::new(Duration::from_millis(10));
        rl.check("k", 10);
        std::thread::sleep(Duration::from_millis(20));
        rl.sweep(Duration::from_millis(5));
        assert_eq!(rl.len(), 0);
    }
}
