//! The zero-trust gateway.
//!
//! Every inbound call — user-facing, agent-to-agent, or third-party — flows
//! through `handle()`: authenticate, rate-check, authorize, audit. There is
//! no network-origin exemption; an agent calling a sibling agent presents
//! the same token a human would.
//!
//! Authentication and authorization failures are terminal for the
//! triggering request — they are surfaced to the caller and never retried
//! by the core.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use arbiter_contracts::{
    audit::AuditEntry,
    error::{ArbiterError, ArbiterResult},
    message::{GatewayRequest, GatewayResponse},
    principal::{Decision, Principal},
};
use arbiter_ledger::{Ledger, LedgerEvent};

use crate::{policy::AccessPolicy, rate::{RateLimitConfig, RateLimiter}, token};

/// The zero-trust request gate.
///
/// Owns the trusted components — the token secret, the access policy, the
/// rate guard — and writes every decision to the ledger before answering.
pub struct ZeroTrustGateway {
    token_secret: String,
    policy: AccessPolicy,
    limiter: RateLimiter,
    ledger: Arc<dyn Ledger>,
}

impl ZeroTrustGateway {
    /// Create a gateway with the given trusted components.
    pub fn new(
        token_secret: impl Into<String>,
        policy: AccessPolicy,
        rate_limit: RateLimitConfig,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            token_secret: token_secret.into(),
            policy,
            limiter: RateLimiter::new(rate_limit),
            ledger,
        }
    }

    /// Verify a credential and reconstruct its principal.
    pub fn authenticate(&self, credential: &str, now: DateTime<Utc>) -> ArbiterResult<Principal> {
        token::verify_token(&self.token_secret, credential, now)
    }

    /// Decide whether `principal` may perform `action` on `resource`.
    ///
    /// Every decision — allow or deny — is appended to the ledger before it
    /// is returned; a ledger failure aborts the request rather than letting
    /// an unaudited decision through.
    pub fn authorize(
        &self,
        principal: &Principal,
        action: &str,
        resource: &str,
        now: DateTime<Utc>,
    ) -> ArbiterResult<Decision> {
        let decision = self.policy.evaluate(principal, action, resource);
        self.audit_decision(principal, action, resource, decision.clone(), now)?;
        Ok(decision)
    }

    /// Process one inbound request: authenticate → rate-check → authorize.
    ///
    /// The response taxonomy follows the request surface contract:
    /// - `Allowed` — authenticated, within rate, and policy said yes.
    /// - `Denied` — authenticated, but policy said no.
    /// - `Error` — the request never reached a policy decision (malformed
    ///   request, bad credential, rate guard, ledger failure).
    pub fn handle(&self, request: &GatewayRequest, now: DateTime<Utc>) -> GatewayResponse {
        if request.action.is_empty() || request.resource.is_empty() {
            return GatewayResponse::Error {
                kind: "malformed-request".to_string(),
                message: "action and resource must be non-empty".to_string(),
            };
        }

        // ── Authentication ───────────────────────────────────────────────────
        let principal = match self.authenticate(&request.credential, now) {
            Ok(principal) => principal,
            Err(e) => {
                warn!(action = %request.action, error = %e, "authentication failed");
                return error_response(&e);
            }
        };

        // ── Rate guard ───────────────────────────────────────────────────────
        //
        // Checked after authentication (an unauthenticated caller has no
        // principal to meter) but before authorization — the guard fires
        // independent of what policy would have said.
        if !self.limiter.check(&principal.id, now) {
            let err = ArbiterError::RateLimitExceeded {
                principal: principal.id.0.clone(),
            };
            let deny = Decision::Deny {
                reason: "rate limit exceeded".to_string(),
            };
            if let Err(audit_err) =
                self.audit_decision(&principal, &request.action, &request.resource, deny, now)
            {
                return error_response(&audit_err);
            }
            return error_response(&err);
        }

        // ── Authorization ────────────────────────────────────────────────────
        match self.authorize(&principal, &request.action, &request.resource, now) {
            Ok(Decision::Allow) => {
                info!(
                    principal = %principal.id.0,
                    action = %request.action,
                    resource = %request.resource,
                    "request allowed"
                );
                GatewayResponse::Allowed {
                    body: request.payload.clone(),
                }
            }
            Ok(Decision::Deny { reason }) => {
                info!(
                    principal = %principal.id.0,
                    action = %request.action,
                    resource = %request.resource,
                    reason = %reason,
                    "request denied"
                );
                GatewayResponse::Denied { reason }
            }
            Err(e) => error_response(&e),
        }
    }

    /// Append one authorization decision to the ledger.
    fn audit_decision(
        &self,
        principal: &Principal,
        action: &str,
        resource: &str,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> ArbiterResult<()> {
        debug!(principal = %principal.id.0, action, resource, ?decision, "auditing decision");
        self.ledger.record(LedgerEvent::Audit(AuditEntry::Authorization {
            principal: principal.id.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
            decision,
            timestamp: now,
        }))
    }
}

/// Map an error to the wire-facing `Error` response.
fn error_response(error: &ArbiterError) -> GatewayResponse {
    GatewayResponse::Error {
        kind: error_kind(error).to_string(),
        message: error.to_string(),
    }
}

/// The stable kebab-case kind string for an error, used in responses.
fn error_kind(error: &ArbiterError) -> &'static str {
    match error {
        ArbiterError::UnknownAgent { .. } => "unknown-agent",
        ArbiterError::DuplicateCapabilityConflict { .. } => "duplicate-capability-conflict",
        ArbiterError::NoCapableAgent { .. } => "no-capable-agent",
        ArbiterError::InvalidCredential { .. } => "invalid-credential",
        ArbiterError::ExpiredCredential { .. } => "expired-credential",
        ArbiterError::RateLimitExceeded { .. } => "rate-limit-exceeded",
        ArbiterError::StageExhausted { .. } => "stage-exhausted",
        ArbiterError::LedgerWriteFailure { .. } => "ledger-write-failure",
        ArbiterError::ContractViolation { .. } => "contract-violation",
        ArbiterError::StateMachineError { .. } => "state-machine-error",
        ArbiterError::UnknownRun { .. } => "unknown-run",
        ArbiterError::UnknownTask { .. } => "unknown-task",
        ArbiterError::ConfigError { .. } => "config-error",
    }
}
