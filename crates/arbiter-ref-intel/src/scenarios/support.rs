//! Shared wiring for the reference scenarios.
//!
//! Builds a full in-process Arbiter stack — ledger, registry, gateway,
//! engine — with the mock fleet registered and healthy, and provides the
//! driver loop that plays the agents' side of the conversation.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use arbiter_contracts::{
    agent::{AgentDescriptor, AgentHealth, AgentId, TrustDescriptor},
    capability::Capability,
    error::{ArbiterError, ArbiterResult},
    message::{CompletionMessage, GatewayRequest, GatewayResponse, IntelligenceEvent},
    principal::{Principal, PrincipalId, Role, Scope},
};
use arbiter_engine::{EngineConfig, PipelineEngine};
use arbiter_gateway::{issue_token, AccessPolicy, RateLimitConfig, ZeroTrustGateway};
use arbiter_ledger::{InMemoryLedger, Ledger};
use arbiter_registry::{AgentRegistry, RegistryConfig};

use crate::{
    connector::{CollectingSink, DispatchQueue, QueueConnector},
    mock_agents::MockAgentPool,
};

/// The access policy every scenario runs under.
pub(crate) const ORCHESTRATOR_POLICY: &str = include_str!("../../policies/orchestrator.toml");

/// Token-signing secret for the demo deployment.
pub(crate) const TOKEN_SECRET: &str = "ref-intel-demo-secret";

/// One fully wired in-process Arbiter stack.
pub(crate) struct IntelRuntime {
    pub ledger: Arc<InMemoryLedger>,
    pub registry: Arc<AgentRegistry>,
    pub gateway: ZeroTrustGateway,
    pub engine: PipelineEngine,
    pub queue: DispatchQueue,
    pub events: Arc<Mutex<Vec<IntelligenceEvent>>>,
}

/// The five mock agents and the capability each serves.
pub(crate) const FLEET: &[(&str, &str)] = &[
    ("scout-1", "identify-competitors"),
    ("scraper-1", "scrape-products"),
    ("research-1", "enrich-entity"),
    ("synth-1", "synthesize-report"),
    ("voice-1", "answer-query"),
];

/// Build the stack with the mock fleet registered and heartbeating.
///
/// Backoff is zeroed so retries re-dispatch inside the driver loop instead
/// of waiting for a maintenance tick.
pub(crate) fn build_runtime(now: DateTime<Utc>) -> ArbiterResult<IntelRuntime> {
    let ledger = Arc::new(InMemoryLedger::new());
    let registry = Arc::new(AgentRegistry::new(
        RegistryConfig::default(),
        ledger.clone() as Arc<dyn Ledger>,
    ));

    for (name, capability) in FLEET {
        let id = registry.register(
            AgentDescriptor {
                id: AgentId::new(*name),
                capabilities: [Capability::new(*capability)].into_iter().collect(),
                trust: TrustDescriptor {
                    principal_id: PrincipalId::new(format!("agent:{name}")),
                },
            },
            now,
        )?;
        registry.heartbeat(&id, AgentHealth::Healthy, now)?;
    }

    let gateway = ZeroTrustGateway::new(
        TOKEN_SECRET,
        AccessPolicy::from_toml_str(ORCHESTRATOR_POLICY)?,
        RateLimitConfig {
            max_requests: 120,
            window: Duration::seconds(60),
        },
        ledger.clone() as Arc<dyn Ledger>,
    );

    let connector = QueueConnector::new();
    let queue = connector.queue();
    let sink = CollectingSink::new();
    let events = sink.events();

    let engine = PipelineEngine::new(
        EngineConfig {
            base_backoff: Duration::zero(),
            max_backoff: Duration::zero(),
            ..EngineConfig::default()
        },
        registry.clone(),
        ledger.clone() as Arc<dyn Ledger>,
        Box::new(connector),
        Box::new(sink),
    );

    Ok(IntelRuntime {
        ledger,
        registry,
        gateway,
        engine,
        queue,
        events,
    })
}

/// Issue an analyst token able to start pipelines and read runs.
pub(crate) fn analyst_token(expires_at: DateTime<Utc>) -> ArbiterResult<String> {
    issue_token(
        TOKEN_SECRET,
        &Principal {
            id: PrincipalId::new("analyst-1"),
            role: Role::new("analyst"),
            scopes: vec![Scope::new("pipeline:start")],
        },
        expires_at,
    )
}

/// Issue the fleet's agent token for completion reporting.
pub(crate) fn agent_token(expires_at: DateTime<Utc>) -> ArbiterResult<String> {
    issue_token(
        TOKEN_SECRET,
        &Principal {
            id: PrincipalId::new("agent:fleet"),
            role: Role::new("agent"),
            scopes: vec![Scope::new("task:complete")],
        },
        expires_at,
    )
}

/// Play the agents' side of the conversation until the queue drains.
///
/// Every hop back into the core — acknowledgement and completion — passes
/// through the gateway first, exactly like an external agent would: there
/// is no trusted in-process shortcut.
pub(crate) fn drive(runtime: &IntelRuntime, pool: &MockAgentPool) -> ArbiterResult<()> {
    while let Some(envelope) = runtime.queue.pop() {
        let now = Utc::now();

        let hop = GatewayRequest {
            credential: agent_token(now + Duration::minutes(5))?,
            action: "task.complete".to_string(),
            resource: format!("task/{}", envelope.task_id),
            payload: serde_json::Value::Null,
        };
        match runtime.gateway.handle(&hop, now) {
            GatewayResponse::Allowed { .. } => {}
            refused => {
                return Err(ArbiterError::StateMachineError {
                    reason: format!("agent hop refused by gateway: {:?}", refused),
                });
            }
        }

        runtime.engine.acknowledge(envelope.task_id, now)?;
        let status = pool.execute(&envelope);
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
