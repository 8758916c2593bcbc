//! Ledger event and export types.
//!
//! `LedgerEvent` is the unit of durability: run creation, every task state
//! transition (with payload snapshots), run state changes, and audit
//! entries all land on one hash chain. `ChainedEvent` wraps an event with
//! sequence numbering and the SHA-256 hashes that make tampering
//! detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbiter_contracts::{
    audit::AuditEntry,
    pipeline::{RunId, RunState},
    task::TransitionRecord,
};

/// One durable orchestration event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LedgerEvent {
    /// A pipeline run was instantiated. Carries everything replay needs to
    /// rebuild the run: the definition coordinates and the request payload.
    RunCreated {
        run_id: RunId,
        definition: String,
        version: u32,
        request: Value,
        timestamp: DateTime<Utc>,
    },

    /// A task moved between states.
    Transition(TransitionRecord),

    /// The derived run state changed.
    RunStateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    },

    /// An authorization decision or health transition.
    Audit(AuditEntry),
}

impl LedgerEvent {
    /// The run this event belongs to, if any. Audit entries are global.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::RunCreated { run_id, .. } => Some(*run_id),
            Self::Transition(record) => Some(record.run_id),
            Self::RunStateChanged { run_id, .. } => Some(*run_id),
            Self::Audit(_) => None,
        }
    }
}

/// A single entry in the ledger's SHA-256 hash chain.
///
/// Each entry commits to the previous one via `prev_hash`, forming an
/// append-only chain. Modifying any field — including those of the embedded
/// event — invalidates `this_hash` and every subsequent `prev_hash`, which
/// `verify_chain` detects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedEvent {
    /// Monotonically increasing position in the chain, starting at 0.
    pub sequence: u64,

    /// The durable event.
    pub event: LedgerEvent,

    /// SHA-256 hash (hex) of the previous entry, or `GENESIS_HASH` for the
    /// first entry.
    pub prev_hash: String,

    /// SHA-256 hash (hex) of this entry's canonical content.
    pub this_hash: String,
}

impl ChainedEvent {
    /// The sentinel `prev_hash` used for the first entry in every chain.
    ///
    /// 64 hex zeros — a value that can never be the SHA-256 of real data,
    /// making genesis detection unambiguous.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A snapshot of the full chain, exported for audit tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerExport {
    /// All entries in chain order (sequence 0 first).
    pub events: Vec<ChainedEvent>,

    /// Wall-clock time (UTC) the export was taken.
    pub exported_at: DateTime<Utc>,

    /// The `this_hash` of the last entry. Empty string if the chain is empty.
    pub terminal_hash: String,
}
