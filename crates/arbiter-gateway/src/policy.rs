//! TOML-driven authorization policy.
//!
//! `AccessPolicy` loads an `AccessPolicyConfig` from a TOML string or file
//! and evaluates principals against it.
//!
//! Evaluation algorithm:
//!
//! 1. Iterate rules in declaration order.
//! 2. For the first rule whose `role`, `action`, and `resource` patterns
//!    match:
//!    a. Verify the principal holds every scope listed in
//!       `required_scopes`. If any are missing → `Deny` (defense-in-depth;
//!       the `allow` effect is overridden by missing scopes, not by rule
//!       order).
//!    b. Convert `RuleEffect` → `Decision` and return.
//! 3. If no rule matched → `Deny` with "denied by default".

use std::path::Path;

use tracing::{debug, warn};

use arbiter_contracts::{
    error::{ArbiterError, ArbiterResult},
    principal::{Decision, Principal},
};

use crate::rule::{AccessPolicyConfig, RuleEffect};

/// A deny-by-default authorization policy read from a TOML document.
#[derive(Debug)]
pub struct AccessPolicy {
    config: AccessPolicyConfig,
}

impl AccessPolicy {
    /// Parse `s` as TOML and build an `AccessPolicy`.
    ///
    /// Returns `ConfigError` if the TOML is malformed or does not match
    /// the expected `AccessPolicyConfig` schema.
    pub fn from_toml_str(s: &str) -> ArbiterResult<Self> {
        let config: AccessPolicyConfig =
            toml::from_str(s).map_err(|e| ArbiterError::ConfigError {
                reason: format!("failed to parse policy TOML: {}", e),
            })?;
        Ok(Self { config })
    }

    /// Read the file at `path` and parse it as TOML policy configuration.
    pub fn from_file(path: &Path) -> ArbiterResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ArbiterError::ConfigError {
            reason: format!("failed to read policy file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Evaluate `principal` requesting `action` on `resource`.
    ///
    /// Rules are tested in declaration order; the first rule matching the
    /// principal's role and the action/resource pair is applied. A matching
    /// rule with unmet `required_scopes` always produces `Deny`, even when
    /// its effect is `allow`. No match produces the deny-by-default
    /// verdict.
    pub fn evaluate(&self, principal: &Principal, action: &str, resource: &str) -> Decision {
        debug!(
            principal = %principal.id.0,
            role = %principal.role.0,
            action,
            resource,
            "evaluating access policy"
        );

        for rule in &self.config.rules {
            if !rule.matches(&principal.role.0, action, resource) {
                continue;
            }

            debug!(rule_id = %rule.id, action, resource, "rule matched");

            // Defense-in-depth scope check: even a matching allow rule is
            // overridden if the principal lacks a required scope.
            for required in &rule.required_scopes {
                if !principal.has_scope(required) {
                    warn!(
                        rule_id = %rule.id,
                        scope = %required,
                        principal = %principal.id.0,
                        "matched rule requires scope principal does not hold"
                    );
                    return Decision::Deny {
                        reason: format!(
                            "rule '{}' requires scope '{}' which principal '{}' does not hold",
                            rule.id, required, principal.id.0
                        ),
                    };
                }
            }

            return match rule.effect {
                RuleEffect::Allow => Decision::Allow,
                RuleEffect::Deny => Decision::Deny {
                    reason: rule
                        .deny_reason
                        .clone()
                        .unwrap_or_else(|| format!("denied by rule '{}'", rule.id)),
                },
            };
        }

        // No rule matched — deny by default.
        warn!(
            action,
            resource,
            principal = %principal.id.0,
            "no policy rule matched; denying by default"
        );

        Decision::Deny {
            reason: format!(
                "denied by default: no policy rule matched action '{}' on resource '{}'",
                action, resource
            ),
        }
    }
}
