//! Wire messages at the core's boundaries.
//!
//! Three surfaces: the inbound request envelope consumed by the gateway,
//! the agent-facing dispatch/completion pair, and the terminal event handed
//! to the digest/alert sink. Everything here is plain serde data — delivery
//! transports are external collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{capability::Capability, pipeline::RunId, task::TaskId};

/// An inbound request as the gateway receives it.
///
/// `credential` is the caller's bearer token; the gateway never sees — and
/// never trusts — the network origin of the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub credential: String,
    /// The action the caller wants to perform (e.g. "pipeline.start").
    pub action: String,
    /// The resource the action targets (e.g. "pipeline/competitor-digest").
    pub resource: String,
    /// Opaque request body, handed through on allow.
    pub payload: Value,
}

/// The gateway's answer to an inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum GatewayResponse {
    /// Authenticated, within rate, and authorized. The validated payload is
    /// handed onward.
    Allowed { body: Value },
    /// Authenticated but refused by policy or rate guard.
    Denied { reason: String },
    /// The request never reached a policy decision (bad credential,
    /// ledger failure, malformed request).
    Error { kind: String, message: String },
}

/// The dispatch envelope handed to an agent.
///
/// `task_id` is the stable idempotence key: an agent receiving the same id
/// twice (crash-recovery re-delivery) must deduplicate rather than repeat
/// side effects. `attempt` distinguishes genuine retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub attempt: u32,
    pub capability: Capability,
    pub input: Value,
    /// Completion deadline; missing the deadline is treated as a failure.
    pub deadline: DateTime<Utc>,
}

/// The terminal status an agent reports for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CompletionStatus {
    Success { output: Value },
    Failure { error: String },
}

/// An agent's completion signal for a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub status: CompletionStatus,
}

/// A finalized pipeline run, emitted to the digest/alert sink.
///
/// Delivery (email, webhook, push) is an external collaborator's concern;
/// the core only produces the structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceEvent {
    pub run_id: RunId,
    pub definition: String,
    pub version: u32,
    /// All stage outputs of the completed run, keyed by stage name.
    pub payload: Value,
    pub completed_at: DateTime<Utc>,
}
