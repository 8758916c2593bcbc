//! # arbiter-gateway
//!
//! The zero-trust gateway for the Arbiter orchestration core.
//!
//! ## Overview
//!
//! Every inbound request — from the user-facing API, from one agent to
//! another, or from a third-party integration — carries a signed bearer
//! token and passes through the same gate: authenticate, rate-check,
//! authorize, audit. Network origin is never consulted; there is no
//! "internal network" exemption.
//!
//! Authorization is deny-by-default: rules are declared in a TOML file,
//! evaluated in order, and the first matching rule wins. If no rule
//! matches, the request is denied.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use arbiter_gateway::{AccessPolicy, RateLimitConfig, ZeroTrustGateway};
//!
//! let policy = AccessPolicy::from_file(Path::new("policies/orchestrator.toml"))?;
//! let gateway = ZeroTrustGateway::new(secret, policy, RateLimitConfig::default(), ledger);
//! let response = gateway.handle(&request, Utc::now());
//! ```

pub mod gateway;
pub mod policy;
pub mod rate;
pub mod rule;
pub mod token;

pub use gateway::ZeroTrustGateway;
pub use policy::AccessPolicy;
pub use rate::{RateLimitConfig, RateLimiter};
pub use rule::{AccessPolicyConfig, AccessRule, RuleEffect};
pub use token::{issue_token, verify_token};

// ── Tests ─────────────────────────────────────────────────────────────────────
