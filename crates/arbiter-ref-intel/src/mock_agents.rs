//! Deterministic mock agents for the five reference capabilities.
//!
//! One pool stands in for the whole fleet: the driver pops a dispatch
//! envelope, the pool produces the completion an agent of that capability
//! would send. Outputs are hardcoded and fictional but keep the shapes the
//! production agents emit — strict JSON with the fields downstream stages
//! map over.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::{json, Value};

use arbiter_contracts::message::{CompletionStatus, DispatchEnvelope};

/// A fleet of mock agents keyed by capability.
///
/// `with_flaky_research` makes the enrichment agent fail its first N
/// attempts — the knob behind the retry scenarios.
pub struct MockAgentPool {
    research_failures: AtomicU32,
}

impl MockAgentPool {
    /// A pool whose agents always succeed.
    pub fn new() -> Self {
        Self {
            research_failures: AtomicU32::new(0),
        }
    }

    /// A pool whose enrichment agent fails its first `failures` attempts.
    pub fn with_flaky_research(failures: u32) -> Self {
        Self {
            research_failures: AtomicU32::new(failures),
        }
    }

    /// Produce the completion an agent of the envelope's capability would
    /// report.
    pub fn execute(&self, envelope: &DispatchEnvelope) -> CompletionStatus {
        match envelope.capability.0.as_str() {
            "identify-competitors" => CompletionStatus::Success {
                output: identify_competitors(&envelope.input),
            },
            "scrape-products" => CompletionStatus::Success {
                output: scrape_products(&envelope.input),
            },
            "enrich-entity" => {
                if self
                    .research_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    CompletionStatus::Failure {
                        error: "enrichment source timeout".to_string(),
                    }
                } else {
                    CompletionStatus::Success {
                        output: enrich_entity(&envelope.input),
                    }
                }
            }
            "synthesize-report" => CompletionStatus::Success {
                output: synthesize_report(&envelope.input),
            },
            "answer-query" => CompletionStatus::Success {
                output: answer_query(&envelope.input),
            },
            other => CompletionStatus::Failure {
                error: format!("no mock agent for capability '{other}'"),
            },
        }
    }
}

impl Default for MockAgentPool {
    fn default() -> Self {
        Self::new()
    }
}

// ── Capability behaviors ──────────────────────────────────────────────────────

/// Scout: given a company, return its direct competitors as strict JSON.
fn identify_competitors(input: &Value) -> Value {
    let company = input["company"].as_str().unwrap_or("unknown");
    json!({
        "company": company,
        "competitors": [
            {
                "name": "Northwind Analytics",
                "domain": "northwind-analytics.example",
                "category": "market-intelligence",
            },
            {
                "name": "Contoso Insights",
                "domain": "contoso-insights.example",
                "category": "market-intelligence",
            }
        ],
        "confidence": 0.82,
    })
}

/// Scraper: given a storefront domain, return its product listings.
fn scrape_products(input: &Value) -> Value {
    let domain = input.as_str().unwrap_or("unknown.example");
    json!({
        "store": domain,
        "products": [
            { "title": "Insight Feed (Starter)", "price": 49.0, "currency": "USD" },
            { "title": "Insight Feed (Team)", "price": 199.0, "currency": "USD" },
        ],
        "pages_crawled": 3,
    })
}

/// Research: given one competitor, return an enriched profile.
fn enrich_entity(input: &Value) -> Value {
    let name = input["name"].as_str().unwrap_or("unknown");
    let domain = input["domain"].as_str().unwrap_or("unknown.example");
    json!({
        "name": name,
        "domain": domain,
        "funding_stage": "series-b",
        "headcount_estimate": 140,
        "positioning": format!("{name} sells dashboard-first market intelligence to mid-market buyers"),
    })
}

/// Synthesizer: given the merged upstream outputs, produce the digest.
fn synthesize_report(input: &Value) -> Value {
    let sources = input.as_object().map(|m| m.len()).unwrap_or(0);
    let names: Vec<String> = input
        .as_object()
        .into_iter()
        .flat_map(|m| m.values())
        .filter_map(|v| v["name"].as_str())
        .map(|s| s.to_string())
        .collect();

    let digest = if names.is_empty() {
        format!("Competitive digest synthesized from {sources} upstream source(s).")
    } else {
        format!(
            "Competitive digest: {} now compete on pricing transparency; monitor their product feeds.",
            names.join(" and ")
        )
    };

    json!({
        "digest": digest,
        "highlights": names,
        "sources": sources,
    })
}

/// Voice: given the digest, produce the spoken-brief answer.
fn answer_query(input: &Value) -> Value {
    let digest = input["digest"].as_str().unwrap_or("no digest available");
    json!({
        "answer": format!("Here is your briefing. {digest}"),
        "speech_ready": true,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
