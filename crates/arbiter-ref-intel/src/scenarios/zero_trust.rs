//! Scenario 3: Zero Trust at the Gate
//!
//! Five callers hit the gateway; only one gets through:
//!
//!   1. analyst with the pipeline:start scope       → ALLOWED
//!   2. integration with no matching allow rule     → DENIED (deny-by-default)
//!   3. analyst presenting an expired token         → ERROR expired-credential
//!   4. tampered token (payload altered after sign) → ERROR invalid-credential
//!   5. analyst hammering past the rate window      → ERROR rate-limit-exceeded
//!
//! Every decision — allow and deny alike — lands on the hash-chained audit
//! trail, which is verified at the end.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use arbiter_contracts::{
    error::ArbiterResult,
    message::{GatewayRequest, GatewayResponse},
    principal::{Principal, PrincipalId, Role, Scope},
};
use arbiter_gateway::{issue_token, AccessPolicy, RateLimitConfig, ZeroTrustGateway};
use arbiter_ledger::{InMemoryLedger, Ledger, LedgerEvent};

use super::support::{ORCHESTRATOR_POLICY, TOKEN_SECRET};

/// Build a gateway with a deliberately small rate window so the rate guard
/// can be demonstrated in a handful of requests.
fn build_gateway(ledger: Arc<InMemoryLedger>) -> ArbiterResult<ZeroTrustGateway> {
    Ok(ZeroTrustGateway::new(
        TOKEN_SECRET,
        AccessPolicy::from_toml_str(ORCHESTRATOR_POLICY)?,
        RateLimitConfig {
            max_requests: 3,
            window: Duration::seconds(60),
        },
        ledger as Arc<dyn Ledger>,
    ))
}

fn token(id: &str, role: &str, scopes: &[&str], expires_at: chrono::DateTime<Utc>) -> ArbiterResult<String> {
    issue_token(
        TOKEN_SECRET,
        &Principal {
            id: PrincipalId::new(id),
            role: Role::new(role),
            scopes: scopes.iter().map(|s| Scope::new(*s)).collect(),
        },
        expires_at,
    )
}

fn describe(response: &GatewayResponse) -> String {
    match response {
        GatewayResponse::Allowed { .. } => "ALLOWED".to_string(),
        GatewayResponse::Denied { reason } => format!("DENIED ({reason})"),
        GatewayResponse::Error { kind, .. } => format!("ERROR ({kind})"),
    }
}

// ── Scenario runner ───────────────────────────────────────────────────────────

/// Run Scenario 3: the gateway's decision surface, one caller at a time.
pub fn run_scenario() -> ArbiterResult<()> {
    println!("=== Scenario 3: Zero Trust at the Gate ===");
    println!();

    let now = Utc::now();
    let ledger = Arc::new(InMemoryLedger::new());
    let gateway = build_gateway(ledger.clone())?;

    let request = |credential: String| GatewayRequest {
        credential,
        action: "pipeline.start".to_string(),
        resource: "pipeline/competitor-digest".to_string(),
        payload: json!({ "company": "Acme Outfitters" }),
    };

    // 1. Scoped analyst: the one legitimate caller.
    let analyst = token("analyst-1", "analyst", &["pipeline:start"], now + Duration::hours(1))?;
    let response = gateway.handle(&request(analyst.clone()), now);
    println!("  [1] analyst with pipeline:start     → {}", describe(&response));

    // 2. Integration role: no allow rule matches — deny-by-default.
    let integration = token("partner-feed", "integration", &[], now + Duration::hours(1))?;
    let response = gateway.handle(&request(integration), now);
    println!("  [2] integration, no matching rule   → {}", describe(&response));

    // 3. Expired analyst token: authentication fails before policy runs.
    let expired = token("analyst-1", "analyst", &["pipeline:start"], now - Duration::minutes(1))?;
    let response = gateway.handle(&request(expired), now);
    println!("  [3] expired analyst token           → {}", describe(&response));

    // 4. Tampered token: role upgraded after signing.
    let tampered = token("analyst-1", "analyst", &[], now + Duration::hours(1))?
        .replace(".analyst.", ".admin.");
    let response = gateway.handle(&request(tampered), now);
    println!("  [4] tampered token                  → {}", describe(&response));

    // 5. Rate guard: the analyst already spent one request in [1]; two more
    //    fill the window, the fourth trips the guard.
    let _second = gateway.handle(&request(analyst.clone()), now);
    let _third = gateway.handle(&request(analyst.clone()), now);
    let fourth = gateway.handle(&request(analyst), now);
    println!("  [5] fourth request in the window    → {}", describe(&fourth));
    println!();

    // ── Audit trail ───────────────────────────────────────────────────────────

    let export = ledger.export();
    let decisions = export
        .events
        .iter()
        .filter(|e| matches!(e.event, LedgerEvent::Audit(_)))
        .count();
    println!(
        "  Audit trail: {} decision(s), chain {}",
        decisions,
        if ledger.verify_integrity() { "VERIFIED" } else { "INTEGRITY FAILURE" }
    );
    println!("  Scenario 3 complete.");
    println!();

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
