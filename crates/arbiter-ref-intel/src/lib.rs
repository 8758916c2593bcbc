//! # arbiter-ref-intel
//!
//! Competitive-intelligence reference runtime for the Arbiter orchestration
//! core.
//!
//! Demonstrates three scenarios using deterministic mock agents:
//!
//! 1. **Intelligence Pipeline** — Scout → Scraper ∥ Research → Synthesizer
//!    → Voice, end to end through the zero-trust gateway, with fan-out,
//!    fan-in, and an output contract on the scout stage.
//! 2. **Retry Storm** — a flaky research agent that recovers on its third
//!    attempt, and one that never does, exhausting the stage and failing
//!    the run while upstream results survive.
//! 3. **Zero Trust** — allowed, denied, expired, and rate-limited callers,
//!    each decision landing on the audit chain.
//!
//! All data is hardcoded and fictional. No external API calls are made.

pub mod connector;
pub mod mock_agents;
pub mod scenarios;
