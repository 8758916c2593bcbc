//! Stage input construction.
//!
//! Applies a stage's declared `InputMapping` over the run's request payload
//! and the accumulated upstream outputs. Mapping is total: an upstream that
//! produced nothing (an optional stage that failed) contributes JSON `null`
//! — the explicit partial-input marker downstream agents are written
//! against.

use std::collections::HashMap;

use serde_json::Value;

use arbiter_contracts::pipeline::{InputMapping, StageSpec};

/// Build the dispatch input for `stage`.
pub fn build_stage_input(
    stage: &StageSpec,
    request: &Value,
    outputs: &HashMap<String, Value>,
) -> Value {
    match &stage.mapping {
        InputMapping::Request => request.clone(),

        InputMapping::Output { stage: upstream } => {
            outputs.get(upstream).cloned().unwrap_or(Value::Null)
        }

        InputMapping::Pointer { stage: upstream, pointer } => outputs
            .get(upstream)
            .and_then(|output| output.pointer(pointer))
            .cloned()
            .unwrap_or(Value::Null),

        InputMapping::Merge => Value::Object(
            stage
                .depends_on
                .iter()
                .map(|dep| {
                    (
                        dep.clone(),
                        outputs.get(dep).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect(),
        ),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
