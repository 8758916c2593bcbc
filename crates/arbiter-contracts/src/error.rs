//! Error taxonomy for the Arbiter orchestration core.
//!
//! All fallible operations return `ArbiterResult<T>`. Variants carry enough
//! context to produce actionable ledger and audit entries.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// The unified error type for the orchestration core.
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// An operation referenced an agent the registry does not know.
    #[error("unknown agent '{agent_id}'")]
    UnknownAgent { agent_id: String },

    /// Registration would violate the unique-capability-ownership policy.
    #[error("capability '{capability}' is already owned by agent '{holder}'")]
    DuplicateCapabilityConflict { capability: String, holder: String },

    /// No healthy agent holds the requested capability.
    #[error("no capable agent for capability '{capability}'")]
    NoCapableAgent { capability: String },

    /// The presented credential is malformed or its signature does not verify.
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: String },

    /// The presented credential was once valid but has expired.
    #[error("credential expired at {expired_at}")]
    ExpiredCredential { expired_at: DateTime<Utc> },

    /// The principal exceeded its request-rate window.
    #[error("rate limit exceeded for principal '{principal}'")]
    RateLimitExceeded { principal: String },

    /// A pipeline stage exhausted its retry budget.
    #[error("stage '{stage}' (capability '{capability}') exhausted after {attempts} attempts")]
    StageExhausted {
        stage: String,
        capability: String,
        attempts: u32,
    },

    /// The ledger could not persist an event.
    ///
    /// This is treated as fatal — a transition that cannot be recorded
    /// cannot proceed, since the ledger is the basis for crash recovery.
    #[error("ledger write failed: {reason}")]
    LedgerWriteFailure { reason: String },

    /// A stage output violated its declared output contract.
    #[error("output contract violated for stage '{stage}': {reason}")]
    ContractViolation { stage: String, reason: String },

    /// A task or run state machine encountered an illegal transition.
    #[error("state machine error: {reason}")]
    StateMachineError { reason: String },

    /// An operation referenced a pipeline run the engine does not know.
    #[error("unknown pipeline run '{run_id}'")]
    UnknownRun { run_id: String },

    /// An operation referenced a task the engine does not know.
    #[error("unknown task '{task_id}'")]
    UnknownTask { task_id: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },
}

/// Convenience alias used throughout the Arbiter crates.
pub type ArbiterResult<T> = Result<T, ArbiterError>;
