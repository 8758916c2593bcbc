//! # arbiter-contracts
//!
//! Shared types, messages, and contracts for the Arbiter orchestration core.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate — only data definitions and error types.

pub mod agent;
pub mod audit;
pub mod capability;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod principal;
pub mod task;

#[cfg(test)]
mod tests {
    use super::*;
    use capability::{Capability, CapabilitySet};
    use error::ArbiterError;
    use pipeline::{InputMapping, RunState};
    use principal::{Decision, Principal, PrincipalId, Role, Scope};
    use task::{TaskId, TaskState};

    // ── CapabilitySet ────────────────────────────────────────────────────────

    #[test]
    fn capability_set_grant_and_has() {
        let mut caps = CapabilitySet::default();
        let scout = Capability::new("identify-competitors");
        let synth = Capability::new("synthesize-report");

        // Nothing granted yet.
        assert!(!caps.has(&scout));
        assert!(!caps.has(&synth));

        caps.grant(scout.clone());
        assert!(caps.has(&scout));
        assert!(!caps.has(&synth));

        caps.grant(synth.clone());
        assert!(caps.has(&scout));
        assert!(caps.has(&synth));
    }

    #[test]
    fn capability_set_duplicate_grant_is_idempotent() {
        let mut caps = CapabilitySet::default();
        caps.grant(Capability::new("enrich-entity"));
        caps.grant(Capability::new("enrich-entity"));

        // HashSet semantics: duplicates are silently dropped.
        assert_eq!(caps.all().count(), 1);
    }

    #[test]
    fn capability_set_from_iterator() {
        let caps: CapabilitySet = ["answer-query", "scrape-products"]
            .into_iter()
            .map(Capability::new)
            .collect();
        assert!(caps.has(&Capability::new("answer-query")));
        assert!(caps.has(&Capability::new("scrape-products")));
        assert_eq!(caps.all().count(), 2);
    }

    // ── Task state machine ───────────────────────────────────────────────────

    #[test]
    fn task_state_happy_path_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
    }

    #[test]
    fn task_state_retry_loop_transitions() {
        use TaskState::*;
        assert!(Running.can_transition_to(Retrying));
        assert!(Dispatched.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Dispatched));
        // Exhaustion is decided at failure time, so Retrying never goes
        // straight to Failed.
        assert!(!Retrying.can_transition_to(Failed));
    }

    #[test]
    fn task_state_terminal_states_are_sinks() {
        use TaskState::*;
        for terminal in [Succeeded, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Dispatched, Running, Succeeded, Failed, Retrying, Cancelled] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} must not transition to {:?}",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn task_state_cancel_reachable_from_any_non_terminal() {
        use TaskState::*;
        for state in [Pending, Dispatched, Running, Retrying] {
            assert!(
                state.can_transition_to(Cancelled),
                "{:?} must be cancellable",
                state
            );
        }
    }

    #[test]
    fn task_state_no_skipping_dispatch() {
        use TaskState::*;
        // A task can never start running without having been dispatched.
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Succeeded));
    }

    // ── Run state ────────────────────────────────────────────────────────────

    #[test]
    fn run_state_terminality() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    // ── Ids ──────────────────────────────────────────────────────────────────

    #[test]
    fn task_id_new_produces_unique_values() {
        let ids: Vec<TaskId> = (0..100).map(|_| TaskId::new()).collect();

        let unique: std::collections::HashSet<String> =
            ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(unique.len(), 100);
    }

    // ── Principal ────────────────────────────────────────────────────────────

    #[test]
    fn principal_has_scope() {
        let p = Principal {
            id: PrincipalId::new("analyst-1"),
            role: Role::new("analyst"),
            scopes: vec![Scope::new("pipeline:start")],
        };
        assert!(p.has_scope("pipeline:start"));
        assert!(!p.has_scope("registry:write"));
    }

    // ── Serde round-trips ────────────────────────────────────────────────────

    #[test]
    fn decision_deny_round_trips() {
        let original = Decision::Deny {
            reason: "no allow rule matched".to_string(),
        };
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn input_mapping_round_trips() {
        let original = InputMapping::Pointer {
            stage: "scout".to_string(),
            pointer: "/competitors/0".to_string(),
        };
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"type\":\"pointer\""));
        let decoded: InputMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    // ── Error display messages ───────────────────────────────────────────────

    #[test]
    fn error_no_capable_agent_display() {
        let err = ArbiterError::NoCapableAgent {
            capability: "enrich-entity".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("no capable agent"));
        assert!(msg.contains("enrich-entity"));
    }

    #[test]
    fn error_stage_exhausted_display() {
        let err = ArbiterError::StageExhausted {
            stage: "research".to_string(),
            capability: "enrich-entity".to_string(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("research"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn error_ledger_write_failure_display() {
        let err = ArbiterError::LedgerWriteFailure {
            reason: "disk full".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ledger write failed"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn error_rate_limit_display() {
        let err = ArbiterError::RateLimitExceeded {
            principal: "integration-7".to_string(),
        };
        assert!(err.to_string().contains("integration-7"));
    }
}
