//! Stage output contract enforcement.
//!
//! A stage may declare an `OutputContract` — a JSON Schema its output must
//! satisfy before the engine hands it downstream. A violation is treated
//! exactly like an agent-reported failure: it consumes an attempt and goes
//! through the normal retry/exhaustion path, so malformed output never
//! poisons downstream stages.

use serde_json::Value;
use tracing::warn;

use arbiter_contracts::{
    error::{ArbiterError, ArbiterResult},
    pipeline::OutputContract,
};

/// Validate `output` against the stage's declared contract.
///
/// A `null` schema document means "no structural constraint" and always
/// passes. A malformed schema document is reported as a violation rather
/// than a panic, so the failure surfaces through the normal retry path and
/// lands in the ledger.
pub fn check_output(stage: &str, contract: &OutputContract, output: &Value) -> ArbiterResult<()> {
    if contract.json_schema.is_null() {
        return Ok(());
    }

    match jsonschema::validator_for(&contract.json_schema) {
        Ok(validator) => {
            let violations: Vec<String> = validator
                .iter_errors(output)
                .map(|error| format!("JSON Schema violation at {}: {}", error.instance_path, error))
                .collect();

            if violations.is_empty() {
                Ok(())
            } else {
                let reason = violations.join("; ");
                warn!(stage, contract_id = %contract.contract_id, %reason, "output contract violated");
                Err(ArbiterError::ContractViolation {
                    stage: stage.to_string(),
                    reason,
                })
            }
        }
        Err(e) => {
            let reason = format!("invalid JSON Schema document: {e}");
            warn!(stage, contract_id = %contract.contract_id, %reason, "contract compilation failure");
            Err(ArbiterError::ContractViolation {
                stage: stage.to_string(),
                reason,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use arbiter_contracts::{error::ArbiterError, pipeline::OutputContract};

    use super::check_output;

    fn competitor_contract() -> OutputContract {
        OutputContract {
            contract_id: "competitor-list-v1".to_string(),
            json_schema: json!({
                "type": "object",
                "required": ["competitors"],
                "properties": {
                    "competitors": { "type": "array", "items": { "type": "string" } }
                }
            }),
        }
    }

    #[test]
    fn test_conforming_output_passes() {
        let output = json!({ "competitors": ["A", "B"] });
        assert!(check_output("scout", &competitor_contract(), &output).is_ok());
    }

    #[test]
    fn test_missing_field_is_violation() {
        let output = json!({ "something_else": true });
        let result = check_output("scout", &competitor_contract(), &output);
        match result {
            Err(ArbiterError::ContractViolation { stage, reason }) => {
                assert_eq!(stage, "scout");
                assert!(reason.contains("competitors"), "reason: {reason}");
            }
            other => panic!("expected ContractViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_null_schema_is_unconstrained() {
        let contract = OutputContract {
            contract_id: "anything-v1".to_string(),
            json_schema: Value::Null,
        };
        assert!(check_output("scout", &contract, &json!("whatever")).is_ok());
    }

    /// A malformed schema surfaces as a violation, not a panic.
    #[test]
    fn test_malformed_schema_is_violation() {
        let contract = OutputContract {
            contract_id: "broken-v1".to_string(),
            json_schema: json!({ "type": "no-such-type" }),
        };
        let result = check_output("scout", &contract, &json!({}));
        assert!(matches!(result, Err(ArbiterError::ContractViolation { .. })));
    }
}
