//! Per-principal request rate guard.
//!
//! A sliding-window limiter keyed by principal id. The window is pruned on
//! every check, so a burst ages out naturally; the clock is injected so
//! tests are deterministic. Rate decisions are independent of the
//! authorization outcome — a principal can be over its rate with a request
//! that policy would have allowed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use arbiter_contracts::principal::PrincipalId;

/// Tuning knobs for the rate guard.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per principal per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::seconds(60),
        }
    }
}

/// Thread-safe sliding-window rate limiter keyed by principal.
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<PrincipalId, Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a request from `principal` at `now` is within rate.
    ///
    /// Returns `true` and records the request when allowed; returns
    /// `false` without recording when the window is full.
    pub fn check(&self, principal: &PrincipalId, now: DateTime<Utc>) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            // A poisoned lock fails closed: over-admitting under an
            // unknown internal state would defeat the guard.
            Err(_) => return false,
        };

        let timestamps = entries.entry(principal.clone()).or_default();

        // Prune requests that slid out of the window.
        let cutoff = now - self.config.window;
        timestamps.retain(|t| *t > cutoff);

        if timestamps.len() >= self.config.max_requests as usize {
            warn!(principal = %principal.0, "rate limit exceeded");
            return false;
        }

        timestamps.push(now);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
