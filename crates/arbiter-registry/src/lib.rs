//! # arbiter-registry
//!
//! The agent registry for the Arbiter orchestration core.
//!
//! Tracks known agents, their declared capabilities, health, and load. The
//! registry and the ledger are the only mutable shared state in the core;
//! all mutation goes through their narrow contracts.
//!
//! Health follows a one-way staleness ladder — `Healthy → Degraded →
//! Unreachable` — driven by the periodic `sweep`; a fresh heartbeat is the
//! only way back up. Every health transition is appended to the ledger as
//! an audit entry.

pub mod registry;

pub use registry::{AgentRegistry, RegistryConfig};
