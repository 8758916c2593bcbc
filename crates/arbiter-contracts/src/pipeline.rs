//! Pipeline definitions, runs, and run reporting.
//!
//! A `PipelineDefinition` is an immutable, versioned graph of stages. A
//! `PipelineRun` is one live instantiation of a definition; its state is
//! derived from the states of its constituent tasks. Validation (cycle
//! rejection, dependency checking) lives in the engine — this module only
//! defines the shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Capability;

/// How a stage's input payload is constructed from upstream outputs.
///
/// Mapping rules are declared per stage in the pipeline definition. An
/// optional upstream stage that failed contributes JSON `null` wherever a
/// rule references it — the downstream agent sees an explicit partial-input
/// marker, never a silently missing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InputMapping {
    /// The run's original request payload. The usual rule for entry stages.
    Request,
    /// The full output of a single upstream stage, passed through.
    Output { stage: String },
    /// A fragment of an upstream output, selected by RFC 6901 JSON pointer.
    Pointer { stage: String, pointer: String },
    /// An object keyed by stage name, merging the outputs of every declared
    /// upstream dependency. The fan-in rule.
    Merge,
}

/// A JSON Schema contract a stage's output must satisfy before handoff.
///
/// A violation counts as a failed attempt for the producing stage, exactly
/// like an agent-reported failure — malformed output must not poison
/// downstream stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContract {
    /// Stable identifier for this contract (e.g. "competitor-list-v1").
    pub contract_id: String,
    /// The JSON Schema document. `null` means no structural constraint.
    pub json_schema: Value,
}

/// One stage of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique within the definition; names the task in ledger records.
    pub name: String,
    /// The capability an agent must hold to serve this stage.
    pub capability: Capability,
    /// Upstream stages that must settle before this stage dispatches.
    /// Multiple entries declare a fan-in barrier.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How this stage's input is built from upstream outputs.
    pub mapping: InputMapping,
    /// When true, exhausting this stage's retries does not fail the run;
    /// downstream stages proceed with a `null` marker in its place.
    #[serde(default)]
    pub optional: bool,
    /// Output contract enforced at completion, if any.
    #[serde(default)]
    pub output_contract: Option<OutputContract>,
}

/// An immutable, versioned multi-agent workflow.
///
/// Published once, never mutated. The engine rejects cyclic graphs, unknown
/// dependency edges, and mappings that reference non-dependencies at publish
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub version: u32,
    /// Stages in declaration order. Order carries no execution semantics —
    /// only `depends_on` edges do.
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Unique identifier for a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    /// Create a new, unique run id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The lifecycle state of a pipeline run, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Running,
    /// Every required stage's task succeeded.
    Completed,
    /// A non-optional stage exhausted its retries.
    Failed,
    /// Explicitly cancelled by the caller.
    Cancelled,
}

impl RunState {
    /// Return true if no further transitions are possible from this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One live execution instance of a pipeline definition.
///
/// Holds the accumulated intermediate and final stage outputs so partial
/// results from completed upstream stages remain retrievable even when the
/// run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub definition: String,
    pub version: u32,
    pub state: RunState,
    /// The validated request payload that started this run.
    pub request: Value,
    /// Stage outputs accumulated as stages succeed, keyed by stage name.
    pub outputs: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The failing stage of a failed run, surfaced to the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub capability: Capability,
    /// The last error kind reported for the stage.
    pub error: String,
}

/// A caller-facing summary of a run's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    /// Present when the run failed; names the stage, capability, and last
    /// error kind.
    pub failure: Option<StageFailure>,
    /// All stage outputs recorded so far — partial results included.
    pub outputs: HashMap<String, Value>,
}
