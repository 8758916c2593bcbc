//! Audit entry types.
//!
//! An `AuditEntry` is the immutable record of a security-relevant decision:
//! an authorization verdict from the gateway, or a health transition from
//! the registry sweep. Entries are appended to the ledger's hash chain and
//! are never mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentHealth, AgentId},
    principal::{Decision, PrincipalId},
};

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AuditEntry {
    /// The gateway decided an (principal, action, resource) request.
    ///
    /// Written for every decision — allows as well as denies — so the audit
    /// trail answers "who was allowed to do what" and not just "who was
    /// refused".
    Authorization {
        principal: PrincipalId,
        action: String,
        resource: String,
        decision: Decision,
        timestamp: DateTime<Utc>,
    },

    /// The registry moved an agent along the health ladder.
    HealthTransition {
        agent_id: AgentId,
        from: AgentHealth,
        to: AgentHealth,
        /// What prompted the transition (e.g. "heartbeat overdue",
        /// "deregistered").
        reason: String,
        timestamp: DateTime<Utc>,
    },
}
