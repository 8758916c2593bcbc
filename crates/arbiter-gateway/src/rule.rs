//! Authorization rule types and configuration schema.
//!
//! An `AccessPolicyConfig` is deserialized from TOML and holds an ordered
//! list of `AccessRule`s. Rules are evaluated in declaration order — the
//! first matching rule wins. If no rule matches, the gateway denies by
//! default.

use serde::{Deserialize, Serialize};

/// The decision a rule produces when it matches a request.
///
/// Expressed as a plain string in TOML (kebab-case) for human readability:
/// ```toml
/// effect = "allow"
/// effect = "deny"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleEffect {
    Allow,
    Deny,
}

/// A single authorization rule loaded from TOML.
///
/// Rules are matched in the order they appear in the policy file. The first
/// rule whose `role`, `action`, and `resource` patterns all match the
/// incoming request wins; subsequent rules are not evaluated.
///
/// `role`, `action`, and `resource` support the special wildcard value
/// `"*"`, which matches any string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    /// Stable identifier used in audit logs and error messages.
    pub id: String,

    /// Human-readable explanation of what this rule controls.
    pub description: String,

    /// The role pattern to match against the principal's role.
    /// Use `"*"` to match any role.
    pub role: String,

    /// The action pattern. Use `"*"` to match any action.
    pub action: String,

    /// The resource pattern. Use `"*"` to match any resource.
    pub resource: String,

    /// Scopes the principal MUST hold for this rule to produce its
    /// `effect`. If any listed scope is missing, the gateway denies the
    /// request regardless of `effect` — even an explicit `allow` rule
    /// cannot override a missing scope.
    #[serde(default)]
    pub required_scopes: Vec<String>,

    /// The decision this rule produces when it matches and scopes are met.
    pub effect: RuleEffect,

    /// Mandatory when `effect = "deny"`. Written to the audit log.
    pub deny_reason: Option<String>,
}

impl AccessRule {
    /// Return true if this rule matches the given role, action, and resource.
    ///
    /// Matching logic: `"*"` in a rule field matches anything; otherwise
    /// the field must match exactly (case-sensitive).
    pub fn matches(&self, role: &str, action: &str, resource: &str) -> bool {
        let role_matches = self.role == "*" || self.role == role;
        let action_matches = self.action == "*" || self.action == action;
        let resource_matches = self.resource == "*" || self.resource == resource;
        role_matches && action_matches && resource_matches
    }
}

/// The top-level structure deserialized from a TOML policy file.
///
/// Rules are evaluated in the order they appear in the `rules` array.
///
/// Example:
/// ```toml
/// [[rules]]
/// id = "allow-analyst-pipeline-start"
/// description = "Analysts may start intelligence pipelines"
/// role = "analyst"
/// action = "pipeline.start"
/// resource = "*"
/// required_scopes = ["pipeline:start"]
/// effect = "allow"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicyConfig {
    /// Ordered list of rules. First match wins.
    pub rules: Vec<AccessRule>,
}
