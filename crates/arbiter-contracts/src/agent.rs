//! Agent identity, health, and registration types.
//!
//! These types describe agents as the orchestration core sees them. Arbiter
//! does not prescribe agent internals — an agent is a capability set behind
//! a dispatch endpoint, nothing more.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{capability::CapabilitySet, principal::PrincipalId};

/// Stable, human-readable identifier for an agent.
///
/// Chosen by the agent operator at registration time and used across policy
/// rules, routing decisions, and the task ledger.
/// Example: AgentId("scout-eu-1")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    /// Construct an agent id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// The health of an agent as tracked by the registry.
///
/// Transitions only move down the ladder
/// (`Healthy → Degraded → Unreachable`) as heartbeats go stale; a fresh
/// heartbeat is the only way health improves. A newly registered agent is
/// `Unknown` until its first heartbeat and is never routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentHealth {
    /// Registered, but no heartbeat received yet.
    Unknown,
    /// Heartbeating within the configured interval. Dispatch-eligible.
    Healthy,
    /// Heartbeat overdue, or the agent self-reported degradation.
    Degraded,
    /// Heartbeat long overdue, or the agent was deregistered.
    Unreachable,
}

/// The credential identity an agent authenticates as.
///
/// Every agent-to-core and agent-to-agent call carries a token for this
/// principal — agents receive no implicit trust from having registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDescriptor {
    /// The principal the agent's tokens are issued for.
    pub principal_id: PrincipalId,
}

/// Everything an agent declares about itself at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable identity chosen by the operator.
    pub id: AgentId,
    /// The task types this agent can perform.
    pub capabilities: CapabilitySet,
    /// The principal identity the agent authenticates as.
    pub trust: TrustDescriptor,
}

/// A registry-side view of one agent, returned by lookups.
///
/// The registry owns the mutable record; this snapshot is what callers see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub descriptor: AgentDescriptor,
    pub health: AgentHealth,
    /// Wall-clock time of the last accepted heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Number of tasks currently dispatched to this agent.
    pub in_flight: u32,
}
