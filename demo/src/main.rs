//! Arbiter Reference Runtime — Demo CLI
//!
//! Runs one or all of the three competitive-intelligence demo scenarios.
//! Each scenario uses real Arbiter components (registry, zero-trust
//! gateway, hash-chained ledger, pipeline engine) wired together with
//! deterministic mock agents.
//!
//! Usage:
//!   cargo run -p demo -- run-all
//!   cargo run -p demo -- intel-pipeline
//!   cargo run -p demo -- retry-storm
//!   cargo run -p demo -- zero-trust

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arbiter_ref_intel::scenarios::{intel_pipeline, retry_storm, zero_trust};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Arbiter — zero-trust multi-agent orchestration demo.
///
/// Each subcommand runs one or all of the three reference scenarios,
/// demonstrating pipeline sequencing, retry handling, and zero-trust
/// enforcement.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "Arbiter competitive-intelligence reference runtime demo",
    long_about = "Runs Arbiter demo scenarios showing pipeline orchestration with\n\
                  fan-out/fan-in, retry and exhaustion handling, zero-trust\n\
                  authentication on every hop, and ledger chain integrity."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all three scenarios in sequence.
    RunAll,
    /// Scenario 1: Competitive Intelligence Pipeline (fan-out/fan-in).
    IntelPipeline,
    /// Scenario 2: Retry Storm (recovery and exhaustion).
    RetryStorm,
    /// Scenario 3: Zero Trust at the Gate (allow / deny / expire / rate).
    ZeroTrust,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    // Initialize structured logging. Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    print_banner();

    let result = match cli.command {
        Command::RunAll => run_all(),
        Command::IntelPipeline => intel_pipeline::run_scenario(),
        Command::RetryStorm => retry_storm::run_scenario(),
        Command::ZeroTrust => zero_trust::run_scenario(),
    };

    match result {
        Ok(()) => {
            println!("All selected scenarios completed successfully.");
        }
        Err(e) => {
            eprintln!("Demo error: {}", e);
            std::process::exit(1);
        }
    }
}

// ── Scenario dispatch ─────────────────────────────────────────────────────────

fn run_all() -> arbiter_contracts::error::ArbiterResult<()> {
    intel_pipeline::run_scenario()?;
    retry_storm::run_scenario()?;
    zero_trust::run_scenario()?;
    Ok(())
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("ARBITER — Agent Orchestration & Secure Messaging Core");
    println!("Competitive-Intelligence Reference Demo");
    println!("=====================================================");
    println!();
    println!("Arbiter enforcement per request and per hop:");
    println!("  [1] Zero-trust gateway: authenticate → rate-check → authorize (deny-by-default)");
    println!("  [2] Capability router resolves each stage to a healthy agent");
    println!("  [3] Per-task dispatch lease: at most one in-flight dispatch per task");
    println!("  [4] Every transition recorded on the SHA-256 ledger chain BEFORE it takes effect");
    println!("  [5] Retries exclude the failing agent, with exponential backoff and jitter");
    println!();
}
