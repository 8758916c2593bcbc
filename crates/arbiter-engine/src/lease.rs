//! Per-task dispatch leases.
//!
//! At most one in-flight dispatch may exist per task at any instant — the
//! exclusivity guarantee behind "no duplicate side effects". A lease is
//! acquired immediately before a dispatch is recorded and released when
//! the attempt settles (completion, failure, timeout, or cancellation).
//!
//! Leases carry an expiry so a crashed holder cannot wedge a task forever:
//! an expired lease is treated as free.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use arbiter_contracts::task::TaskId;

/// One held dispatch lease.
#[derive(Debug, Clone)]
pub struct DispatchLease {
    pub task_id: TaskId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The lease table guarding dispatch exclusivity.
pub struct LeaseTable {
    ttl: Duration,
    inner: Mutex<HashMap<TaskId, DispatchLease>>,
}

impl LeaseTable {
    /// Create an empty table; leases live for `ttl` unless released.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Try to acquire the dispatch lease for `task_id`.
    ///
    /// Returns `None` when a live (unexpired) lease is already held —
    /// meaning another dispatch for this task is in flight and the caller
    /// must not dispatch again.
    pub fn try_acquire(&self, task_id: TaskId, now: DateTime<Utc>) -> Option<DispatchLease> {
        let mut inner = self.inner.lock().ok()?;

        if let Some(existing) = inner.get(&task_id) {
            if existing.expires_at > now {
                debug!(task_id = %task_id, "dispatch lease already held");
                return None;
            }
        }

        let lease = DispatchLease {
            task_id,
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        inner.insert(task_id, lease.clone());
        Some(lease)
    }

    /// Release the lease for `task_id`. Idempotent.
    pub fn release(&self, task_id: &TaskId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(task_id);
        }
    }

    /// Return true if a live lease is held for `task_id`.
    pub fn is_held(&self, task_id: &TaskId, now: DateTime<Utc>) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .get(task_id)
                    .map(|lease| lease.expires_at > now)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use arbiter_contracts::task::TaskId;

    use super::LeaseTable;

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// A held lease blocks a second acquisition until released.
    #[test]
    fn test_exclusive_acquisition() {
        let table = LeaseTable::new(Duration::seconds(30));
        let task = TaskId::new();

        assert!(table.try_acquire(task, t0()).is_some());
        assert!(table.try_acquire(task, t0()).is_none());

        table.release(&task);
        assert!(table.try_acquire(task, t0()).is_some());
    }

    /// An expired lease is treated as free.
    #[test]
    fn test_expired_lease_is_free() {
        let table = LeaseTable::new(Duration::seconds(30));
        let task = TaskId::new();

        assert!(table.try_acquire(task, t0()).is_some());
        assert!(table.try_acquire(task, t0() + Duration::seconds(31)).is_some());
    }

    /// Leases for different tasks are independent.
    #[test]
    fn test_leases_are_per_task() {
        let table = LeaseTable::new(Duration::seconds(30));
        assert!(table.try_acquire(TaskId::new(), t0()).is_some());
        assert!(table.try_acquire(TaskId::new(), t0()).is_some());
    }

    /// Release is idempotent and unknown ids are tolerated.
    #[test]
    fn test_release_idempotent() {
        let table = LeaseTable::new(Duration::seconds(30));
        let task = TaskId::new();
        table.release(&task);
        assert!(!table.is_held(&task, t0()));
    }
}
