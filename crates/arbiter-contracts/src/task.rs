//! Task identity, state machine, and ledger transition records.
//!
//! A `Task` is one stage's unit of work within a pipeline run. Its state
//! machine is the engine's core invariant surface: transitions for a single
//! task are strictly ordered, attempt counts only grow, and every transition
//! is recorded in the ledger before it takes effect in memory.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{agent::AgentId, capability::Capability, pipeline::RunId};

/// Unique identifier for a single task.
///
/// Doubles as the idempotence key for dispatch: agents are expected to
/// deduplicate dispatch envelopes on this id, so replaying a dispatch after
/// crash recovery does not duplicate externally visible side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    /// Create a new, unique task id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Created; upstream dependencies not yet satisfied or not yet routed.
    Pending,
    /// Handed to an agent; awaiting acknowledgement or completion.
    Dispatched,
    /// The agent acknowledged the envelope and is working.
    Running,
    /// The agent reported success and the output passed its contract.
    Succeeded,
    /// Retry budget exhausted, or the run failed around it.
    Failed,
    /// A failed attempt is waiting out its backoff before re-dispatch.
    Retrying,
    /// The owning run was cancelled, or the run failed, before this task
    /// reached a terminal state of its own.
    Cancelled,
}

impl TaskState {
    /// Return true if no further transitions are possible from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Return true if the task state machine permits `self → next`.
    ///
    /// Legal transitions:
    /// - `Pending → Dispatched | Cancelled`
    /// - `Dispatched → Running | Retrying | Failed | Cancelled`
    /// - `Running → Succeeded | Retrying | Failed | Cancelled`
    /// - `Retrying → Dispatched | Cancelled`
    ///
    /// `Dispatched → Retrying | Failed` covers agents that report failure
    /// without ever acknowledging, and deadline expiry before acknowledgement.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Cancelled)
                | (Dispatched, Running)
                | (Dispatched, Retrying)
                | (Dispatched, Failed)
                | (Dispatched, Cancelled)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Retrying, Dispatched)
                | (Retrying, Cancelled)
        )
    }
}

/// One stage's unit of work within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// The run this task belongs to. A task belongs to exactly one run.
    pub run_id: RunId,
    /// The stage within the run's pipeline definition. Exactly one per task.
    pub stage: String,
    /// The capability required to serve this task.
    pub capability: Capability,
    pub state: TaskState,
    /// The agent the current attempt was dispatched to. None until dispatch.
    pub assigned_agent: Option<AgentId>,
    /// Dispatch attempts whose outcome counted. Monotonically increasing,
    /// bounded by the engine's configured maximum.
    pub attempt: u32,
    /// When true, the next dispatch reuses the current attempt number — set
    /// during crash recovery so an interrupted attempt is re-delivered under
    /// the same idempotence key rather than double-counted.
    pub redelivery: bool,
    /// Agents that already failed this stage; excluded from re-routing.
    pub excluded_agents: HashSet<AgentId>,
    /// Completion deadline for the in-flight attempt.
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest re-dispatch time while `Retrying` (backoff).
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Last reported error, carried into the next attempt's routing decision.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable record of one task state transition, written to the ledger.
///
/// The payload snapshot is present only at `Succeeded` — the ledger is the
/// durable home of stage outputs, so recovery can rebuild handoff data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub stage: String,
    /// The state being left. None for the creation record.
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub attempt: u32,
    /// The agent involved in this transition, if any.
    pub agent: Option<AgentId>,
    /// Stage output snapshot at `Succeeded`.
    pub payload: Option<Value>,
    /// Error detail at `Retrying` / `Failed`.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
