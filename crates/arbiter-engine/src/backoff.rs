//! Retry backoff with deterministic jitter.
//!
//! Delay grows exponentially with the failed attempt number, capped at the
//! configured maximum, plus a jitter term derived from
//! SHA-256(task_id ‖ attempt). Hash-derived jitter spreads retries across
//! tasks the same way random jitter would, while keeping every delay
//! reproducible under test.

use chrono::Duration;
use sha2::{Digest, Sha256};

use arbiter_contracts::task::TaskId;

use crate::EngineConfig;

/// Compute the backoff delay after `attempt` failed for `task_id`.
///
/// `attempt` is 1-based: the first failure waits roughly `base_backoff`,
/// the second roughly double that, and so on up to `max_backoff`. Jitter
/// adds up to half of `base_backoff` on top.
pub fn retry_delay(config: &EngineConfig, task_id: &TaskId, attempt: u32) -> Duration {
    let base_ms = config.base_backoff.num_milliseconds().max(0);
    let max_ms = config.max_backoff.num_milliseconds().max(base_ms);

    // Cap the shift so a large attempt count cannot overflow.
    let exponent = attempt.saturating_sub(1).min(20);
    let exponential = base_ms.saturating_mul(1i64 << exponent).min(max_ms);

    let mut hasher = Sha256::new();
    hasher.update(task_id.0.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();

    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&digest[..8]);
    let seed = u64::from_le_bytes(seed_bytes);

    let jitter_range = (base_ms / 2).max(1) as u64;
    let jitter = (seed % jitter_range) as i64;

    Duration::milliseconds(exponential + jitter)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
