//! Scenario 1: Competitive Intelligence Pipeline
//!
//! The full product flow through the zero-trust gateway:
//!
//!   Scout → (Scraper ∥ Research) → Synthesizer → Voice
//!
//! Stage walk-through:
//!   1. scout       — identifies direct competitors for the requested
//!      company; its output must satisfy the competitor-list contract
//!   2. scrape      — crawls the first competitor's storefront (fan-out)
//!   3. research    — enriches the second competitor's profile (fan-out)
//!   4. synthesize  — fan-in barrier; merges both branches into the digest
//!   5. voice-brief — optional spoken-brief rendering of the digest
//!
//! The analyst's request enters through the gateway, every agent hop is
//! re-authenticated, and the single hash-chained ledger ends up holding
//! the complete story: authorization decisions, task transitions, and the
//! payload snapshots recovery would need.

use chrono::{Duration, Utc};
use serde_json::json;

use arbiter_contracts::{
    capability::Capability,
    error::{ArbiterError, ArbiterResult},
    message::{GatewayRequest, GatewayResponse},
    pipeline::{InputMapping, OutputContract, PipelineDefinition, RunState, StageSpec},
};
use arbiter_ledger::LedgerEvent;

use crate::mock_agents::MockAgentPool;

use super::support::{analyst_token, build_runtime, drive};

// ── Pipeline definition ───────────────────────────────────────────────────────

/// The published competitor-digest pipeline, version 1.
pub fn competitor_digest_definition() -> PipelineDefinition {
    PipelineDefinition {
        name: "competitor-digest".to_string(),
        version: 1,
        stages: vec![
            StageSpec {
                name: "scout".to_string(),
                capability: Capability::new("identify-competitors"),
                depends_on: vec![],
                mapping: InputMapping::Request,
                optional: false,
                output_contract: Some(OutputContract {
                    contract_id: "competitor-list-v1".to_string(),
                    json_schema: json!({
                        "type": "object",
                        "required": ["company", "competitors"],
                        "properties": {
                            "competitors": { "type": "array" }
                        }
                    }),
                }),
            },
            StageSpec {
                name: "scrape".to_string(),
                capability: Capability::new("scrape-products"),
                depends_on: vec!["scout".to_string()],
                mapping: InputMapping::Pointer {
                    stage: "scout".to_string(),
                    pointer: "/competitors/0/domain".to_string(),
                },
                optional: false,
                output_contract: None,
            },
            StageSpec {
                name: "research".to_string(),
                capability: Capability::new("enrich-entity"),
                depends_on: vec!["scout".to_string()],
                mapping: InputMapping::Pointer {
                    stage: "scout".to_string(),
                    pointer: "/competitors/1".to_string(),
                },
                optional: false,
                output_contract: None,
            },
            StageSpec {
                name: "synthesize".to_string(),
                capability: Capability::new("synthesize-report"),
                depends_on: vec!["scrape".to_string(), "research".to_string()],
                mapping: InputMapping::Merge,
                optional: false,
                output_contract: None,
            },
            StageSpec {
                name: "voice-brief".to_string(),
                capability: Capability::new("answer-query"),
                depends_on: vec!["synthesize".to_string()],
                mapping: InputMapping::Output {
                    stage: "synthesize".to_string(),
                },
                optional: true,
                output_contract: None,
            },
        ],
    }
}

// ── Scenario runner ───────────────────────────────────────────────────────────

/// Run Scenario 1: the full pipeline behind the zero-trust gateway.
pub fn run_scenario() -> ArbiterResult<()> {
    println!("=== Scenario 1: Competitive Intelligence Pipeline ===");
    println!();
    println!("  Request:  competitor digest for \"Acme Outfitters\"");
    println!("  Pipeline: scout → (scrape ∥ research) → synthesize → voice-brief");
    println!();

    let now = Utc::now();
    let runtime = build_runtime(now)?;
    runtime.engine.publish(competitor_digest_definition())?;

    // ── Front door ────────────────────────────────────────────────────────────

    let request = GatewayRequest {
        credential: analyst_token(now + Duration::hours(1))?,
        action: "pipeline.start".to_string(),
        resource: "pipeline/competitor-digest".to_string(),
        payload: json!({ "company": "Acme Outfitters" }),
    };

    let body = match runtime.gateway.handle(&request, now) {
        GatewayResponse::Allowed { body } => {
            println!("  Gateway:  analyst-1 allowed for pipeline.start");
            body
        }
        refused => {
            return Err(ArbiterError::StateMachineError {
                reason: format!("analyst request refused: {:?}", refused),
            });
        }
    };

    let run_id = runtime.engine.start_run("competitor-digest", 1, body, now)?;
    println!("  Run:      {run_id}");
    println!();

    // ── Agents at work ────────────────────────────────────────────────────────

    let pool = MockAgentPool::new();
    drive(&runtime, &pool)?;

    let report = runtime.engine.run_report(run_id)?;
    println!("  Stage outputs:");
    for stage in ["scout", "scrape", "research", "synthesize", "voice-brief"] {
        let marker = if report.outputs.contains_key(stage) { "✓" } else { "✗" };
        println!("    {marker} {stage}");
    }
    println!();

    if let Some(digest) = report.outputs.get("synthesize") {
        println!("  Digest:   {}", digest["digest"].as_str().unwrap_or("?"));
    }
    if let Some(brief) = report.outputs.get("voice-brief") {
        println!("  Voice:    {}", brief["answer"].as_str().unwrap_or("?"));
    }
    println!();

    // ── Trust trail ───────────────────────────────────────────────────────────

    let export = runtime.ledger.export();
    let audits = export
        .events
        .iter()
        .filter(|e| matches!(e.event, LedgerEvent::Audit(_)))
        .count();

    println!("  Run state:     {:?}", report.state);
    println!("  Events queued: {}", runtime.events.lock().map(|e| e.len()).unwrap_or(0));
    println!(
        "  Ledger chain:  {} ({} event(s), {} audit decision(s))",
        if runtime.ledger.verify_integrity() { "VERIFIED" } else { "INTEGRITY FAILURE" },
        export.events.len(),
        audits
    );
    if report.state != RunState::Completed {
        println!("  UNEXPECTED run state: {:?}", report.state);
    }
    println!("  Scenario 1 complete.");
    println!();

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
