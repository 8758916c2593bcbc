//! Principals, roles, scopes, and authorization decisions.
//!
//! A `Principal` is any authenticated caller — a human user, an agent, or a
//! third-party integration. The gateway treats all three identically:
//! every hop is authenticated and authorized, with no network-origin
//! exemption.

use serde::{Deserialize, Serialize};

/// Stable identifier for an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    /// Construct a principal id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// The role a principal acts under (e.g. "analyst", "agent", "integration").
///
/// One role per principal per credential; authorization rules match on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role(pub String);

impl Role {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }
}

/// A named permission grain within a role (e.g. "pipeline:start",
/// "registry:write"). Rules may require scopes on top of a role match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }
}

/// An authenticated caller, produced by the gateway from a verified
/// credential and consumed by authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
    pub scopes: Vec<Scope>,
}

impl Principal {
    /// Return true if the principal holds the named scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s.0 == scope)
    }
}

/// The outcome of an authorization check.
///
/// Arbiter is deny-by-default: the absence of an explicit allow rule is a
/// denial, and every decision — allow or deny — is audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The action is permitted.
    Allow,
    /// The action is denied.
    Deny {
        /// Human-readable explanation, written to the audit log.
        reason: String,
    },
}

impl Decision {
    /// Return true for `Allow`.
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}
