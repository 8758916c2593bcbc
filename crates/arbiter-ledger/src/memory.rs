//! In-memory implementation of the `Ledger` trait.
//!
//! `InMemoryLedger` is the reference implementation. It keeps all entries
//! in a `Vec` protected by a `Mutex`, making it safe to share between the
//! gateway, registry, and engine while they append concurrently.
//!
//! Use `export()` to obtain a sealed `LedgerExport`, and
//! `verify_integrity()` at any time to confirm the chain has not been
//! tampered with in memory.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use arbiter_contracts::{
    error::{ArbiterError, ArbiterResult},
    pipeline::RunId,
};

use crate::{
    chain::{hash_event, verify_chain},
    event::{ChainedEvent, LedgerEvent, LedgerExport},
    Ledger,
};

// ── Internal mutable state ────────────────────────────────────────────────────

/// The mutable interior of an `InMemoryLedger`.
pub(crate) struct ChainState {
    /// All entries written so far, in append order.
    pub(crate) events: Vec<ChainedEvent>,

    /// The next sequence number to assign (starts at 0).
    pub(crate) sequence: u64,

    /// The `this_hash` of the last written entry, or `GENESIS_HASH` before
    /// any entry has been written.
    pub(crate) last_hash: String,
}

// ── Public ledger ─────────────────────────────────────────────────────────────

/// An in-memory, append-only ledger backed by a SHA-256 hash chain.
///
/// # Thread safety
///
/// Every method acquires a `Mutex` internally. Multiple components may hold
/// clones of the same ledger handle without additional synchronization.
pub struct InMemoryLedger {
    pub(crate) state: Arc<Mutex<ChainState>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    ///
    /// The internal `last_hash` is initialized to
    /// `ChainedEvent::GENESIS_HASH` so the first entry's `prev_hash` is
    /// automatically correct.
    pub fn new() -> Self {
        let state = ChainState {
            events: Vec::new(),
            sequence: 0,
            last_hash: ChainedEvent::GENESIS_HASH.to_string(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Export a sealed snapshot of the full chain.
    ///
    /// The `terminal_hash` is the `this_hash` of the last entry, or an
    /// empty string when no entries have been written.
    pub fn export(&self) -> LedgerExport {
        let state = self.state.lock().expect("ledger state lock poisoned");
        let terminal_hash = state
            .events
            .last()
            .map(|e| e.this_hash.clone())
            .unwrap_or_default();

        LedgerExport {
            events: state.events.clone(),
            exported_at: Utc::now(),
            terminal_hash,
        }
    }

    /// Verify that the in-memory chain has not been tampered with.
    ///
    /// Delegates to `verify_chain`, which checks both prev-hash linkage and
    /// hash correctness for every entry.
    pub fn verify_integrity(&self) -> bool {
        let state = self.state.lock().expect("ledger state lock poisoned");
        verify_chain(&state.events)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ── Ledger impl ───────────────────────────────────────────────────────────────

impl Ledger for InMemoryLedger {
    /// Append one event to the hash chain.
    ///
    /// Computes `this_hash` from (sequence, prev_hash, event), wraps the
    /// event in a `ChainedEvent`, appends it, then advances the sequence
    /// counter and `last_hash`.
    ///
    /// Returns `Err(LedgerWriteFailure)` only if the internal mutex is
    /// poisoned, which cannot happen under normal operation.
    fn record(&self, event: LedgerEvent) -> ArbiterResult<()> {
        let mut state = self.state.lock().map_err(|e| ArbiterError::LedgerWriteFailure {
            reason: format!("ledger state lock poisoned: {}", e),
        })?;

        let prev_hash = state.last_hash.clone();
        let sequence = state.sequence;

        let this_hash = hash_event(sequence, &event, &prev_hash);

        debug!(sequence, %this_hash, "ledger entry appended");

        let entry = ChainedEvent {
            sequence,
            event,
            prev_hash,
            this_hash: this_hash.clone(),
        };

        state.events.push(entry);
        state.sequence += 1;
        state.last_hash = this_hash;

        Ok(())
    }

    /// Return all events belonging to `run_id`, in chain order.
    fn replay(&self, run_id: &RunId) -> ArbiterResult<Vec<LedgerEvent>> {
        let state = self.state.lock().map_err(|e| ArbiterError::LedgerWriteFailure {
            reason: format!("ledger state lock poisoned: {}", e),
        })?;

        Ok(state
            .events
            .iter()
            .filter(|entry| entry.event.run_id() == Some(*run_id))
            .map(|entry| entry.event.clone())
            .collect())
    }

    /// Return every run that has been created but has not reached a
    /// terminal state, in creation order.
    fn open_runs(&self) -> ArbiterResult<Vec<RunId>> {
        let state = self.state.lock().map_err(|e| ArbiterError::LedgerWriteFailure {
            reason: format!("ledger state lock poisoned: {}", e),
        })?;

        let mut created: Vec<RunId> = Vec::new();
        let mut terminal: std::collections::HashSet<RunId> = std::collections::HashSet::new();

        for entry in &state.events {
            match &entry.event {
                LedgerEvent::RunCreated { run_id, .. } => created.push(*run_id),
                LedgerEvent::RunStateChanged { run_id, to, .. } if to.is_terminal() => {
                    terminal.insert(*run_id);
                }
                _ => {}
            }
        }

        created.retain(|id| !terminal.contains(id));
        Ok(created)
    }
}
