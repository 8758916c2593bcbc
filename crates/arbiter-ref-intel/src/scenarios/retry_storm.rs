//! Scenario 2: Retry Storm
//!
//! Two runs of a three-stage pipeline against a flaky enrichment agent:
//!
//!   Part A — the agent fails twice and recovers: the stage succeeds on
//!   attempt 3 (the configured ceiling) and the run completes.
//!
//!   Part B — the agent never recovers: the stage exhausts its attempts,
//!   the run fails, and the report names the failing stage, capability,
//!   and last error while the scout's output remains retrievable.

use chrono::Utc;
use serde_json::json;

use arbiter_contracts::{
    capability::Capability,
    error::ArbiterResult,
    message::CompletionMessage,
    pipeline::{InputMapping, PipelineDefinition, RunState, StageSpec},
};

use crate::mock_agents::MockAgentPool;

use super::support::{build_runtime, IntelRuntime};

// ── Pipeline definition ───────────────────────────────────────────────────────

/// Scout → research → synthesize, with the research stage under test.
fn enrichment_definition() -> PipelineDefinition {
    PipelineDefinition {
        name: "enrichment-chain".to_string(),
        version: 1,
        stages: vec![
            StageSpec {
                name: "scout".to_string(),
                capability: Capability::new("identify-competitors"),
                depends_on: vec![],
                mapping: InputMapping::Request,
                optional: false,
                output_contract: None,
            },
            StageSpec {
                name: "research".to_string(),
                capability: Capability::new("enrich-entity"),
                depends_on: vec!["scout".to_string()],
                mapping: InputMapping::Pointer {
                    stage: "scout".to_string(),
                    pointer: "/competitors/0".to_string(),
                },
                optional: false,
                output_contract: None,
            },
            StageSpec {
                name: "synthesize".to_string(),
                capability: Capability::new("synthesize-report"),
                depends_on: vec!["research".to_string()],
                mapping: InputMapping::Merge,
                optional: false,
                output_contract: None,
            },
        ],
    }
}

/// Drive the queue while printing each dispatch and its outcome.
fn drive_verbose(runtime: &IntelRuntime, pool: &MockAgentPool) -> ArbiterResult<()> {
    while let Some(envelope) = runtime.queue.pop() {
        let now = Utc::now();
        runtime.engine.acknowledge(envelope.task_id, now)?;
        let status = pool.execute(&envelope);
        let outcome = match &status {
            arbiter_contracts::message::CompletionStatus::Success { .. } => "success",
            arbiter_contracts::message::CompletionStatus::Failure { error } => error.as_str(),
        };
        println!(
            "    dispatch {:<22} attempt {} → {}",
            envelope.capability.0, envelope.attempt, outcome
        );
        runtime.engine.complete(
            CompletionMessage {
                task_id: envelope.task_id,
                status,
            },
            now,
        )?;
    }
    Ok(())
}

// ── Scenario runner ───────────────────────────────────────────────────────────

/// Run Scenario 2: retries with recovery, then retry exhaustion.
pub fn run_scenario() -> ArbiterResult<()> {
    println!("=== Scenario 2: Retry Storm ===");
    println!();

    // ── Part A: fails twice, succeeds on the third attempt ───────────────────

    println!("  Part A — enrichment agent recovers on attempt 3");
    let now = Utc::now();
    let runtime = build_runtime(now)?;
    runtime.engine.publish(enrichment_definition())?;

    let run_id = runtime
        .engine
        .start_run("enrichment-chain", 1, json!({ "company": "Acme Outfitters" }), now)?;
    drive_verbose(&runtime, &MockAgentPool::with_flaky_research(2))?;

    let report = runtime.engine.run_report(run_id)?;
    println!("  Run state: {:?}", report.state);
    if report.state != RunState::Completed {
        println!("  UNEXPECTED: part A should complete");
    }
    println!();

    // ── Part B: never recovers, stage exhausts ───────────────────────────────

    println!("  Part B — enrichment agent never recovers");
    let now = Utc::now();
    let runtime = build_runtime(now)?;
    runtime.engine.publish(enrichment_definition())?;

    let run_id = runtime
        .engine
        .start_run("enrichment-chain", 1, json!({ "company": "Acme Outfitters" }), now)?;
    drive_verbose(&runtime, &MockAgentPool::with_flaky_research(u32::MAX))?;

    let report = runtime.engine.run_report(run_id)?;
    println!("  Run state: {:?}", report.state);
    if let Some(failure) = &report.failure {
        println!(
            "  Failure:   stage '{}' (capability '{}'): {}",
            failure.stage, failure.capability.0, failure.error
        );
    }
    println!(
        "  Upstream:  scout output {} retrievable",
        if report.outputs.contains_key("scout") { "still" } else { "NOT" }
    );
    if report.state != RunState::Failed {
        println!("  UNEXPECTED: part B should fail");
    }
    println!("  Scenario 2 complete.");
    println!();

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
