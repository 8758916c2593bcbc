//! The agent registry: registration, heartbeats, health sweeps, and
//! capability lookup.
//!
//! All time-dependent operations take an explicit `now` so the sweep and
//! staleness logic are deterministic under test. The host is expected to
//! call `sweep` on a periodic schedule, independent of request traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use arbiter_contracts::{
    agent::{AgentDescriptor, AgentHealth, AgentId, AgentView},
    audit::AuditEntry,
    capability::Capability,
    error::{ArbiterError, ArbiterResult},
};
use arbiter_ledger::{Ledger, LedgerEvent};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Tuning knobs for registry behavior.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// When true, `register` fails with `DuplicateCapabilityConflict` if a
    /// declared capability is already served by another live agent.
    pub unique_capability_ownership: bool,
    /// A healthy agent with no heartbeat within this window degrades.
    pub heartbeat_interval: Duration,
    /// A degraded agent silent for this further window becomes unreachable.
    pub unreachable_interval: Duration,
    /// How long a deregistered agent's record lingers so in-flight tasks
    /// can settle before the record disappears.
    pub deregister_grace: Duration,
    /// How long an unreachable agent is kept before removal.
    pub removal_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unique_capability_ownership: false,
            heartbeat_interval: Duration::seconds(30),
            unreachable_interval: Duration::seconds(120),
            deregister_grace: Duration::seconds(60),
            removal_grace: Duration::seconds(600),
        }
    }
}

// ── Internal record ───────────────────────────────────────────────────────────

/// The registry's mutable record for one agent.
struct AgentRecord {
    descriptor: AgentDescriptor,
    health: AgentHealth,
    registered_at: DateTime<Utc>,
    last_heartbeat: Option<DateTime<Utc>>,
    /// Tasks currently dispatched to this agent. Load-balancing key.
    in_flight: u32,
    /// Last dispatch time. Load-balancing tie-breaker.
    last_dispatched_at: Option<DateTime<Utc>>,
    deregistered_at: Option<DateTime<Utc>>,
    unreachable_since: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// The baseline for staleness: last heartbeat, or registration time for
    /// an agent that has never heartbeated.
    fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.registered_at)
    }
}

// ── Public registry ───────────────────────────────────────────────────────────

/// The agent registry.
///
/// # Thread safety
///
/// All state lives behind a `Mutex`; the registry may be shared across the
/// router, engine, and host scheduler via `Arc`.
pub struct AgentRegistry {
    config: RegistryConfig,
    ledger: Arc<dyn Ledger>,
    state: Mutex<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    /// Create an empty registry writing audit entries to `ledger`.
    pub fn new(config: RegistryConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            config,
            ledger,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Register an agent, or refresh the descriptor of an existing one.
    ///
    /// A newly registered agent is `Unknown` until its first heartbeat and
    /// is never routed to. Re-registration of a deregistered id revives the
    /// record (back to `Unknown`).
    ///
    /// Fails with `DuplicateCapabilityConflict` only when
    /// `unique_capability_ownership` is configured and another live agent
    /// already declares one of the descriptor's capabilities.
    pub fn register(&self, descriptor: AgentDescriptor, now: DateTime<Utc>) -> ArbiterResult<AgentId> {
        let mut state = self.lock()?;

        if self.config.unique_capability_ownership {
            for capability in descriptor.capabilities.all() {
                let holder = state.values().find(|record| {
                    record.descriptor.id != descriptor.id
                        && record.deregistered_at.is_none()
                        && record.descriptor.capabilities.has(capability)
                });
                if let Some(holder) = holder {
                    return Err(ArbiterError::DuplicateCapabilityConflict {
                        capability: capability.0.clone(),
                        holder: holder.descriptor.id.0.clone(),
                    });
                }
            }
        }

        let id = descriptor.id.clone();
        info!(agent_id = %id.0, "agent registered");

        state.insert(
            id.clone(),
            AgentRecord {
                descriptor,
                health: AgentHealth::Unknown,
                registered_at: now,
                last_heartbeat: None,
                in_flight: 0,
                last_dispatched_at: None,
                deregistered_at: None,
                unreachable_since: None,
            },
        );

        Ok(id)
    }

    /// Accept a heartbeat from a live agent.
    ///
    /// `status` is the agent's self-report and may only be `Healthy` or
    /// `Degraded` — an agent cannot declare itself `Unreachable`. A fresh
    /// heartbeat is the only path back up the health ladder.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        status: AgentHealth,
        now: DateTime<Utc>,
    ) -> ArbiterResult<()> {
        if !matches!(status, AgentHealth::Healthy | AgentHealth::Degraded) {
            return Err(ArbiterError::StateMachineError {
                reason: format!("agents may only self-report Healthy or Degraded, got {:?}", status),
            });
        }

        let mut state = self.lock()?;
        let record = state
            .get_mut(agent_id)
            .filter(|r| r.deregistered_at.is_none())
            .ok_or_else(|| ArbiterError::UnknownAgent {
                agent_id: agent_id.0.clone(),
            })?;

        record.last_heartbeat = Some(now);
        record.unreachable_since = None;

        if record.health != status {
            let entry = health_transition(agent_id, record.health, status, "heartbeat", now);
            self.ledger.record(LedgerEvent::Audit(entry))?;
            debug!(agent_id = %agent_id.0, from = ?record.health, to = ?status, "heartbeat health change");
            record.health = status;
        }

        Ok(())
    }

    /// Deregister an agent. Idempotent.
    ///
    /// The agent is marked `Unreachable` immediately so routing stops at
    /// once; the record itself is dropped by the sweep after
    /// `deregister_grace`, letting in-flight tasks complete or fail first.
    pub fn deregister(&self, agent_id: &AgentId, now: DateTime<Utc>) -> ArbiterResult<()> {
        let mut state = self.lock()?;

        let Some(record) = state.get_mut(agent_id) else {
            return Ok(());
        };
        if record.deregistered_at.is_some() {
            return Ok(());
        }

        if record.health != AgentHealth::Unreachable {
            let entry =
                health_transition(agent_id, record.health, AgentHealth::Unreachable, "deregistered", now);
            self.ledger.record(LedgerEvent::Audit(entry))?;
            record.health = AgentHealth::Unreachable;
        }
        record.deregistered_at = Some(now);
        record.unreachable_since = Some(now);

        info!(agent_id = %agent_id.0, "agent deregistered");
        Ok(())
    }

    /// Return the healthy holders of `capability`, ordered for dispatch.
    ///
    /// Ordering is the registry's load-balancing key: fewest in-flight
    /// tasks first, then least-recently-dispatched, then id for
    /// determinism. Only `Healthy` agents are eligible — `Unknown`,
    /// `Degraded`, and `Unreachable` agents are never returned.
    pub fn find_capable(&self, capability: &Capability) -> ArbiterResult<Vec<AgentId>> {
        let state = self.lock()?;

        let mut candidates: Vec<(&AgentId, &AgentRecord)> = state
            .iter()
            .filter(|(_, record)| {
                record.deregistered_at.is_none()
                    && record.health == AgentHealth::Healthy
                    && record.descriptor.capabilities.has(capability)
            })
            .collect();

        candidates.sort_by(|(id_a, a), (id_b, b)| {
            a.in_flight
                .cmp(&b.in_flight)
                .then(a.last_dispatched_at.cmp(&b.last_dispatched_at))
                .then(id_a.0.cmp(&id_b.0))
        });

        Ok(candidates.into_iter().map(|(id, _)| id.clone()).collect())
    }

    /// Record that a task was dispatched to `agent_id`.
    ///
    /// Maintains the load-balancing key; fails with `UnknownAgent` if the
    /// record has already been removed.
    pub fn note_dispatch(&self, agent_id: &AgentId, now: DateTime<Utc>) -> ArbiterResult<()> {
        let mut state = self.lock()?;
        let record = state.get_mut(agent_id).ok_or_else(|| ArbiterError::UnknownAgent {
            agent_id: agent_id.0.clone(),
        })?;
        record.in_flight += 1;
        record.last_dispatched_at = Some(now);
        Ok(())
    }

    /// Record that a dispatched task settled (success, failure, or timeout).
    ///
    /// Tolerates agents that were removed while the task was in flight.
    pub fn note_completion(&self, agent_id: &AgentId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(record) = state.get_mut(agent_id) {
                record.in_flight = record.in_flight.saturating_sub(1);
            } else {
                debug!(agent_id = %agent_id.0, "completion for removed agent ignored");
            }
        }
    }

    /// Return a snapshot of one agent's record.
    pub fn get(&self, agent_id: &AgentId) -> Option<AgentView> {
        let state = self.state.lock().ok()?;
        state.get(agent_id).map(|record| AgentView {
            descriptor: record.descriptor.clone(),
            health: record.health,
            last_heartbeat: record.last_heartbeat,
            in_flight: record.in_flight,
        })
    }

    /// Run one staleness sweep and return the audit entries it produced.
    ///
    /// Ladder rules, applied per live agent:
    /// - `Healthy` with no heartbeat within `heartbeat_interval` → `Degraded`
    /// - `Degraded` silent for a further `unreachable_interval` → `Unreachable`
    /// - `Unknown` that never heartbeated within both windows → `Unreachable`
    ///
    /// Removal rules:
    /// - deregistered and past `deregister_grace` → record dropped
    /// - unreachable for `removal_grace` → record dropped
    ///
    /// Each transition is appended to the ledger before it takes effect; a
    /// ledger failure aborts the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> ArbiterResult<Vec<AuditEntry>> {
        let mut state = self.lock()?;
        let mut entries = Vec::new();

        for (id, record) in state.iter_mut() {
            if record.deregistered_at.is_some() {
                continue;
            }

            let silent_for = now - record.last_seen();
            let next = match record.health {
                AgentHealth::Healthy if silent_for > self.config.heartbeat_interval => {
                    Some((AgentHealth::Degraded, "heartbeat overdue"))
                }
                AgentHealth::Degraded
                    if silent_for > self.config.heartbeat_interval + self.config.unreachable_interval =>
                {
                    Some((AgentHealth::Unreachable, "heartbeat long overdue"))
                }
                AgentHealth::Unknown
                    if silent_for > self.config.heartbeat_interval + self.config.unreachable_interval =>
                {
                    Some((AgentHealth::Unreachable, "never heartbeated"))
                }
                _ => None,
            };

            if let Some((to, reason)) = next {
                let entry = health_transition(id, record.health, to, reason, now);
                self.ledger.record(LedgerEvent::Audit(entry.clone()))?;
                warn!(agent_id = %id.0, from = ?record.health, to = ?to, reason, "health transition");
                record.health = to;
                if to == AgentHealth::Unreachable {
                    record.unreachable_since = Some(now);
                }
                entries.push(entry);
            }
        }

        // Drop records whose grace windows have elapsed.
        state.retain(|id, record| {
            let expired_deregistration = record
                .deregistered_at
                .map(|at| now - at > self.config.deregister_grace)
                .unwrap_or(false);
            let prolonged_unreachability = record
                .unreachable_since
                .filter(|_| record.deregistered_at.is_none())
                .map(|at| now - at > self.config.removal_grace)
                .unwrap_or(false);

            if expired_deregistration || prolonged_unreachability {
                info!(agent_id = %id.0, "agent record removed");
                false
            } else {
                true
            }
        });

        Ok(entries)
    }

    fn lock(&self) -> ArbiterResult<std::sync::MutexGuard<'_, HashMap<AgentId, AgentRecord>>> {
        self.state.lock().map_err(|e| ArbiterError::StateMachineError {
            reason: format!("registry state lock poisoned: {}", e),
        })
    }
}

/// Build a health-transition audit entry.
fn health_transition(
    agent_id: &AgentId,
    from: AgentHealth,
    to: AgentHealth,
    reason: &str,
    now: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::HealthTransition {
        agent_id: agent_id.clone(),
        from,
        to,
        reason: reason.to_string(),
        timestamp: now,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
