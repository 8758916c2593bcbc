//! # arbiter-router
//!
//! The capability router: resolves a required capability to a live agent.
//!
//! Routing is stateless given registry state — the router holds no cache
//! beyond the registry's own load-balancing order, so a health change in
//! the registry affects the very next routing decision.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use arbiter_contracts::{
    agent::AgentId,
    capability::Capability,
    error::{ArbiterError, ArbiterResult},
};
use arbiter_registry::AgentRegistry;

/// Maps a required capability to a dispatchable agent.
pub struct CapabilityRouter {
    registry: Arc<AgentRegistry>,
}

impl CapabilityRouter {
    /// Create a router over the given registry.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `capability` to an agent, skipping everything in `exclude`.
    ///
    /// The exclusion set carries the agents that already failed the current
    /// stage, so a retry never re-selects a degraded or buggy agent. The
    /// first survivor of the registry's load-balanced ordering wins.
    ///
    /// Fails with `NoCapableAgent` when the filtered sequence is empty.
    pub fn route(
        &self,
        capability: &Capability,
        exclude: &HashSet<AgentId>,
    ) -> ArbiterResult<AgentId> {
        let candidates = self.registry.find_capable(capability)?;

        let selected = candidates.into_iter().find(|id| !exclude.contains(id));

        match selected {
            Some(agent_id) => {
                debug!(capability = %capability.0, agent_id = %agent_id.0, "routed");
                Ok(agent_id)
            }
            None => Err(ArbiterError::NoCapableAgent {
                capability: capability.0.clone(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use arbiter_contracts::{
        agent::{AgentDescriptor, AgentHealth, AgentId, TrustDescriptor},
        capability::Capability,
        error::ArbiterError,
        principal::PrincipalId,
    };
    use arbiter_ledger::InMemoryLedger;
    use arbiter_registry::{AgentRegistry, RegistryConfig};

    use super::CapabilityRouter;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    fn setup(agents: &[&str]) -> (Arc<AgentRegistry>, CapabilityRouter) {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), ledger));
        for name in agents {
            let id = registry
                .register(
                    AgentDescriptor {
                        id: AgentId::new(*name),
                        capabilities: [Capability::new("enrich-entity")].into_iter().collect(),
                        trust: TrustDescriptor {
                            principal_id: PrincipalId::new(format!("agent:{name}")),
                        },
                    },
                    now(),
                )
                .unwrap();
            registry.heartbeat(&id, AgentHealth::Healthy, now()).unwrap();
        }
        let router = CapabilityRouter::new(registry.clone());
        (registry, router)
    }

    /// The router returns the first candidate of the registry's ordering.
    #[test]
    fn test_route_selects_first_candidate() {
        let (_, router) = setup(&["research-a", "research-b"]);
        let agent = router
            .route(&Capability::new("enrich-entity"), &HashSet::new())
            .unwrap();
        assert_eq!(agent, AgentId::new("research-a"));
    }

    /// Excluded agents are skipped.
    #[test]
    fn test_route_applies_exclusion() {
        let (_, router) = setup(&["research-a", "research-b"]);
        let exclude: HashSet<_> = [AgentId::new("research-a")].into_iter().collect();
        let agent = router.route(&Capability::new("enrich-entity"), &exclude).unwrap();
        assert_eq!(agent, AgentId::new("research-b"));
    }

    /// An empty filtered sequence is NoCapableAgent.
    #[test]
    fn test_route_no_capable_agent() {
        let (_, router) = setup(&["research-a"]);
        let exclude: HashSet<_> = [AgentId::new("research-a")].into_iter().collect();
        let result = router.route(&Capability::new("enrich-entity"), &exclude);
        assert!(matches!(result, Err(ArbiterError::NoCapableAgent { .. })));
    }

    /// Routing reacts immediately to registry health changes — no caching.
    #[test]
    fn test_route_follows_health_changes() {
        let (registry, router) = setup(&["research-a", "research-b"]);
        let cap = Capability::new("enrich-entity");

        registry
            .heartbeat(&AgentId::new("research-a"), AgentHealth::Degraded, now())
            .unwrap();

        let agent = router.route(&cap, &HashSet::new()).unwrap();
        assert_eq!(agent, AgentId::new("research-b"));
    }
}
