//! Engine trait seams.
//!
//! Two boundaries separate the trusted engine from the outside world:
//!
//! - `AgentConnector` — the transport that carries dispatch envelopes to
//!   agents and cancellation signals after them. Untrusted territory
//!   begins on the far side of this trait.
//! - `EventSink` — the consumer of finalized pipeline runs (digest and
//!   alert delivery). An external collaborator; delivery failures are
//!   logged, never fatal to the run.
//!
//! The engine wires them together with the registry, router, and ledger,
//! and enforces the transition ordering on every call.

use arbiter_contracts::{
    error::ArbiterResult,
    message::{DispatchEnvelope, IntelligenceEvent},
    task::TaskId,
};

/// The transport between the engine and its agents.
///
/// `dispatch` is a non-blocking handoff: implementations must queue or
/// send the envelope and return without waiting for the agent to finish.
/// The completion signal arrives later through `PipelineEngine::complete`.
pub trait AgentConnector: Send + Sync {
    /// Hand one envelope to the assigned agent.
    ///
    /// The envelope's `task_id` is the idempotence key — an agent seeing
    /// the same id twice must deduplicate rather than repeat side effects.
    /// An `Err` is treated exactly like an agent-reported failure and
    /// consumes an attempt.
    fn dispatch(&self, envelope: &DispatchEnvelope) -> ArbiterResult<()>;

    /// Signal cancellation for an in-flight task. Best effort — the agent
    /// may already be finishing, and no confirmation is expected.
    fn cancel(&self, task_id: &TaskId);
}

/// The consumer of finalized pipeline runs.
pub trait EventSink: Send + Sync {
    /// Deliver one terminal intelligence event.
    ///
    /// Errors are logged by the engine and do not affect the run's state —
    /// the payload remains retrievable from the run and the ledger.
    fn deliver(&self, event: &IntelligenceEvent) -> ArbiterResult<()>;
}
