//! The pipeline engine.
//!
//! One engine instance drives every run it started or recovered. All
//! mutable run state lives behind a single `Mutex`; the lease table has
//! its own lock and is always acquired *after* the state lock, never
//! before — the one lock-ordering rule in this crate.
//!
//! Dispatch is a non-blocking handoff: `advance` computes the eligible
//! batch under the lock, releases it, and only then calls the connector,
//! so a synchronous connector can never deadlock against the engine.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use arbiter_contracts::{
    agent::AgentId,
    error::{ArbiterError, ArbiterResult},
    message::{CompletionMessage, CompletionStatus, DispatchEnvelope, IntelligenceEvent},
    pipeline::{
        PipelineDefinition, PipelineRun, RunId, RunReport, RunState, StageFailure, StageSpec,
    },
    task::{Task, TaskId, TaskState, TransitionRecord},
};
use arbiter_ledger::{Ledger, LedgerEvent};
use arbiter_registry::AgentRegistry;
use arbiter_router::CapabilityRouter;

use crate::{
    backoff::retry_delay,
    contract::check_output,
    definition::validate_definition,
    lease::LeaseTable,
    mapping::build_stage_input,
    traits::{AgentConnector, EventSink},
    EngineConfig,
};

// ── Internal state ────────────────────────────────────────────────────────────

/// One live run and its tasks, keyed by stage name.
struct RunSlot {
    run: PipelineRun,
    definition: Arc<PipelineDefinition>,
    tasks: HashMap<String, Task>,
}

#[derive(Default)]
struct EngineState {
    runs: HashMap<RunId, RunSlot>,
    /// TaskId → (owning run, stage name).
    task_index: HashMap<TaskId, (RunId, String)>,
}

/// Deferred work computed under the state lock and performed after it is
/// released — sink delivery, cancellation signals, and follow-up dispatch
/// never run while the lock is held.
enum AfterSettle {
    /// The signal referenced a task that already settled. Nothing to do.
    Stale,
    /// The task settled; the run may have newly eligible stages.
    Advance(RunId),
    /// The run reached `Completed`; deliver the terminal event.
    RunCompleted(RunId, IntelligenceEvent),
    /// The run reached `Failed`; signal cancellation for in-flight tasks.
    RunFailed(Vec<TaskId>),
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// The pipeline engine.
///
/// Owns the trusted components — router, ledger, connector, sink — and
/// enforces the transition ordering on every operation.
pub struct PipelineEngine {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    router: CapabilityRouter,
    ledger: Arc<dyn Ledger>,
    connector: Box<dyn AgentConnector>,
    sink: Box<dyn EventSink>,
    definitions: Mutex<HashMap<(String, u32), Arc<PipelineDefinition>>>,
    leases: LeaseTable,
    state: Mutex<EngineState>,
}

impl PipelineEngine {
    /// Create an engine over the given shared registry and ledger.
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        ledger: Arc<dyn Ledger>,
        connector: Box<dyn AgentConnector>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let router = CapabilityRouter::new(registry.clone());
        let leases = LeaseTable::new(config.lease_ttl);
        Self {
            config,
            registry,
            router,
            ledger,
            connector,
            sink,
            definitions: Mutex::new(HashMap::new()),
            leases,
            state: Mutex::new(EngineState::default()),
        }
    }

    // ── Definitions ──────────────────────────────────────────────────────────

    /// Validate and freeze a pipeline definition under `(name, version)`.
    ///
    /// Published definitions are immutable; republishing an existing
    /// version is a `ConfigError`. Cyclic graphs, unknown dependency
    /// edges, and mappings referencing non-dependencies are rejected here,
    /// before any run can be started.
    pub fn publish(&self, definition: PipelineDefinition) -> ArbiterResult<()> {
        validate_definition(&definition)?;

        let mut definitions = self.lock_definitions()?;
        let key = (definition.name.clone(), definition.version);
        if definitions.contains_key(&key) {
            return Err(ArbiterError::ConfigError {
                reason: format!(
                    "pipeline '{}' version {} is already published",
                    key.0, key.1
                ),
            });
        }

        info!(name = %key.0, version = key.1, stages = definition.stages.len(), "pipeline published");
        definitions.insert(key, Arc::new(definition));
        Ok(())
    }

    // ── Run lifecycle ────────────────────────────────────────────────────────

    /// Instantiate a published definition as a new run and dispatch its
    /// entry stages.
    pub fn start_run(
        &self,
        name: &str,
        version: u32,
        request: Value,
        now: DateTime<Utc>,
    ) -> ArbiterResult<RunId> {
        let definition = {
            let definitions = self.lock_definitions()?;
            definitions
                .get(&(name.to_string(), version))
                .cloned()
                .ok_or_else(|| ArbiterError::ConfigError {
                    reason: format!("pipeline '{}' version {} is not published", name, version),
                })?
        };

        let run_id = RunId::new();

        // Ledger-first: the run and its task skeleton must be durable
        // before anything is dispatched.
        self.ledger.record(LedgerEvent::RunCreated {
            run_id,
            definition: name.to_string(),
            version,
            request: request.clone(),
            timestamp: now,
        })?;

        let mut tasks: HashMap<String, Task> = HashMap::new();
        for spec in &definition.stages {
            let task = Task {
                id: TaskId::new(),
                run_id,
                stage: spec.name.clone(),
                capability: spec.capability.clone(),
                state: TaskState::Pending,
                assigned_agent: None,
                attempt: 0,
                redelivery: false,
                excluded_agents: HashSet::new(),
                deadline: None,
                next_eligible_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            self.ledger.record(LedgerEvent::Transition(TransitionRecord {
                run_id,
                task_id: task.id,
                stage: task.stage.clone(),
                from: None,
                to: TaskState::Pending,
                attempt: 0,
                agent: None,
                payload: None,
                error: None,
                timestamp: now,
            }))?;
            tasks.insert(spec.name.clone(), task);
        }

        {
            let mut state = self.lock_state()?;
            for task in tasks.values() {
                state.task_index.insert(task.id, (run_id, task.stage.clone()));
            }
            state.runs.insert(
                run_id,
                RunSlot {
                    run: PipelineRun {
                        id: run_id,
                        definition: name.to_string(),
                        version,
                        state: RunState::Running,
                        request,
                        outputs: HashMap::new(),
                        created_at: now,
                        updated_at: now,
                    },
                    definition,
                    tasks,
                },
            );
        }

        info!(run_id = %run_id, pipeline = name, version, "run started");
        self.advance(run_id, now)?;
        Ok(run_id)
    }

    /// Dispatch every stage of `run_id` that became eligible.
    ///
    /// A stage is eligible when its task is `Pending` (or `Retrying` with
    /// its backoff elapsed) and every upstream dependency has settled —
    /// `Succeeded`, or `Failed` on an optional stage. The connector is
    /// called outside the state lock; a connector error is treated as an
    /// agent-reported failure for that attempt.
    pub fn advance(&self, run_id: RunId, now: DateTime<Utc>) -> ArbiterResult<()> {
        loop {
            let batch = self.dispatch_ready(run_id, now)?;
            if batch.is_empty() {
                return Ok(());
            }
            for envelope in batch {
                debug!(
                    task_id = %envelope.task_id,
                    capability = %envelope.capability.0,
                    attempt = envelope.attempt,
                    "dispatching"
                );
                if let Err(e) = self.connector.dispatch(&envelope) {
                    warn!(task_id = %envelope.task_id, error = %e, "connector dispatch failed");
                    self.settle(envelope.task_id, Err(format!("dispatch failed: {e}")), now)?;
                }
            }
        }
    }

    /// Record that an agent acknowledged its envelope (`Dispatched → Running`).
    ///
    /// A stale acknowledgement — the attempt already timed out or settled —
    /// is ignored rather than treated as an error, since agents may ack and
    /// complete in quick succession.
    pub fn acknowledge(&self, task_id: TaskId, now: DateTime<Utc>) -> ArbiterResult<()> {
        let mut state = self.lock_state()?;
        let (run_id, stage) = self.locate(&state, task_id)?;
        let slot = state.runs.get_mut(&run_id).ok_or_else(|| ArbiterError::UnknownRun {
            run_id: run_id.to_string(),
        })?;
        let task = slot.tasks.get_mut(&stage).ok_or_else(|| ArbiterError::UnknownTask {
            task_id: task_id.to_string(),
        })?;

        if task.state != TaskState::Dispatched {
            debug!(task_id = %task_id, state = ?task.state, "stale acknowledgement ignored");
            return Ok(());
        }

        ensure_legal(task, TaskState::Running)?;
        self.ledger.record(LedgerEvent::Transition(TransitionRecord {
            run_id,
            task_id,
            stage: task.stage.clone(),
            from: Some(task.state),
            to: TaskState::Running,
            attempt: task.attempt,
            agent: task.assigned_agent.clone(),
            payload: None,
            error: None,
            timestamp: now,
        }))?;
        task.state = TaskState::Running;
        task.updated_at = now;
        Ok(())
    }

    /// Apply an agent's completion signal.
    ///
    /// Success runs the stage's output contract first — a violation is
    /// converted into a failure for the same attempt. Failures retry with
    /// the reporting agent excluded, up to the attempt ceiling.
    pub fn complete(&self, message: CompletionMessage, now: DateTime<Utc>) -> ArbiterResult<()> {
        let outcome = match message.status {
            CompletionStatus::Success { output } => Ok(output),
            CompletionStatus::Failure { error } => Err(error),
        };
        self.settle(message.task_id, outcome, now)
    }

    /// Cancel a run: every non-terminal task transitions to `Cancelled`,
    /// in-flight agents receive a best-effort cancellation signal, and no
    /// further dispatch occurs. Idempotent on terminal runs.
    pub fn cancel_run(&self, run_id: RunId, now: DateTime<Utc>) -> ArbiterResult<()> {
        let in_flight = {
            let mut state = self.lock_state()?;
            let slot = state.runs.get_mut(&run_id).ok_or_else(|| ArbiterError::UnknownRun {
                run_id: run_id.to_string(),
            })?;

            if slot.run.state != RunState::Running {
                return Ok(());
            }

            self.ledger.record(LedgerEvent::RunStateChanged {
                run_id,
                from: slot.run.state,
                to: RunState::Cancelled,
                timestamp: now,
            })?;
            slot.run.state = RunState::Cancelled;
            slot.run.updated_at = now;

            self.cancel_open_tasks(run_id, slot, now)?
        };

        info!(run_id = %run_id, "run cancelled");
        for task_id in &in_flight {
            self.connector.cancel(task_id);
        }
        Ok(())
    }

    /// Run one periodic maintenance pass at `now`.
    ///
    /// Applies deadline expiry — a `Dispatched`/`Running` task past its
    /// deadline fails exactly like an agent-reported failure — and then
    /// re-advances every live run so elapsed backoffs and newly healthy
    /// agents take effect.
    pub fn tick(&self, now: DateTime<Utc>) -> ArbiterResult<()> {
        let (expired, live_runs) = {
            let state = self.lock_state()?;
            let mut expired: Vec<TaskId> = Vec::new();
            let mut live_runs: Vec<RunId> = Vec::new();
            for (run_id, slot) in &state.runs {
                if slot.run.state != RunState::Running {
                    continue;
                }
                live_runs.push(*run_id);
                for task in slot.tasks.values() {
                    let overdue = matches!(task.state, TaskState::Dispatched | TaskState::Running)
                        && task.deadline.map(|d| d < now).unwrap_or(false);
                    if overdue {
                        expired.push(task.id);
                    }
                }
            }
            (expired, live_runs)
        };

        for task_id in expired {
            warn!(task_id = %task_id, "task deadline exceeded");
            self.settle(task_id, Err("deadline exceeded".to_string()), now)?;
        }
        for run_id in live_runs {
            self.advance(run_id, now)?;
        }
        Ok(())
    }

    /// Rebuild every non-terminal run from the ledger and resume it.
    ///
    /// Replayed tasks stuck in `Dispatched`/`Running` — their dispatch
    /// outcome is unknown — return to `Retrying` flagged for redelivery:
    /// the re-dispatch reuses the same attempt number and task id, and the
    /// receiving agent deduplicates on that id, so the interrupted attempt
    /// is neither double-counted nor double-executed.
    ///
    /// Definitions must be re-published before recovery; an open run whose
    /// definition is unknown is a `ConfigError`.
    pub fn recover(&self, now: DateTime<Utc>) -> ArbiterResult<Vec<RunId>> {
        let open = self.ledger.open_runs()?;
        let mut recovered = Vec::new();

        for run_id in open {
            {
                let state = self.lock_state()?;
                if state.runs.contains_key(&run_id) {
                    continue;
                }
            }

            let events = self.ledger.replay(&run_id)?;
            let slot = self.rebuild_slot(run_id, &events, now)?;

            {
                let mut state = self.lock_state()?;
                for task in slot.tasks.values() {
                    state.task_index.insert(task.id, (run_id, task.stage.clone()));
                }
                state.runs.insert(run_id, slot);
            }

            info!(run_id = %run_id, "run recovered from ledger");
            recovered.push(run_id);
            self.advance(run_id, now)?;
        }

        Ok(recovered)
    }

    // ── Views ────────────────────────────────────────────────────────────────

    /// A caller-facing summary of one run: state, failure detail, and all
    /// stage outputs recorded so far — partial results included.
    pub fn run_report(&self, run_id: RunId) -> ArbiterResult<RunReport> {
        let state = self.lock_state()?;
        let slot = state.runs.get(&run_id).ok_or_else(|| ArbiterError::UnknownRun {
            run_id: run_id.to_string(),
        })?;

        let failure = slot.definition.stages.iter().find_map(|spec| {
            let task = slot.tasks.get(&spec.name)?;
            if task.state == TaskState::Failed && !spec.optional {
                Some(StageFailure {
                    stage: spec.name.clone(),
                    capability: spec.capability.clone(),
                    error: task
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            } else {
                None
            }
        });

        Ok(RunReport {
            run_id,
            state: slot.run.state,
            failure,
            outputs: slot.run.outputs.clone(),
        })
    }

    /// A snapshot of one task, if the engine knows it.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        let state = self.state.lock().ok()?;
        let (run_id, stage) = state.task_index.get(&task_id)?.clone();
        state.runs.get(&run_id)?.tasks.get(&stage).cloned()
    }

    // ── Dispatch internals ───────────────────────────────────────────────────

    /// Compute and record the dispatch batch for `run_id` under the state
    /// lock. Each returned envelope has already been leased, counted
    /// against its agent, and recorded as `Dispatched` in the ledger — the
    /// caller only has to hand it to the connector.
    fn dispatch_ready(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> ArbiterResult<Vec<DispatchEnvelope>> {
        let mut state = self.lock_state()?;
        let slot = state.runs.get_mut(&run_id).ok_or_else(|| ArbiterError::UnknownRun {
            run_id: run_id.to_string(),
        })?;

        if slot.run.state != RunState::Running {
            return Ok(Vec::new());
        }

        let definition = slot.definition.clone();
        let mut batch = Vec::new();

        for spec in &definition.stages {
            let Some(task) = slot.tasks.get(&spec.name) else {
                continue;
            };

            let eligible = match task.state {
                TaskState::Pending => deps_settled(&definition, &slot.tasks, spec),
                TaskState::Retrying => {
                    task.next_eligible_at.map(|at| at <= now).unwrap_or(true)
                        && deps_settled(&definition, &slot.tasks, spec)
                }
                _ => false,
            };
            if !eligible {
                continue;
            }

            ensure_legal(task, TaskState::Dispatched)?;
            let task_id = task.id;
            let exclude = task.excluded_agents.clone();

            let Some(agent) = self.select_agent(spec, &exclude)? else {
                continue;
            };
            let Some(_lease) = self.leases.try_acquire(task_id, now) else {
                // Another dispatcher holds this task; exclusivity wins.
                continue;
            };

            let attempt = if task.redelivery { task.attempt } else { task.attempt + 1 };
            let input = build_stage_input(spec, &slot.run.request, &slot.run.outputs);
            let deadline = now + self.config.dispatch_timeout;

            if let Err(e) = self.registry.note_dispatch(&agent, now) {
                // The agent vanished between routing and accounting; leave
                // the stage queued for the next pass.
                self.leases.release(&task_id);
                warn!(agent = %agent.0, error = %e, "routed agent disappeared before dispatch");
                continue;
            }

            let record = TransitionRecord {
                run_id,
                task_id,
                stage: spec.name.clone(),
                from: Some(task.state),
                to: TaskState::Dispatched,
                attempt,
                agent: Some(agent.clone()),
                payload: None,
                error: None,
                timestamp: now,
            };
            if let Err(e) = self.ledger.record(LedgerEvent::Transition(record)) {
                self.registry.note_completion(&agent);
                self.leases.release(&task_id);
                return Err(e);
            }

            let task = slot
                .tasks
                .get_mut(&spec.name)
                .ok_or_else(|| ArbiterError::UnknownTask {
                    task_id: task_id.to_string(),
                })?;
            task.state = TaskState::Dispatched;
            task.attempt = attempt;
            task.redelivery = false;
            task.assigned_agent = Some(agent);
            task.deadline = Some(deadline);
            task.next_eligible_at = None;
            task.updated_at = now;

            batch.push(DispatchEnvelope {
                task_id,
                run_id,
                attempt,
                capability: spec.capability.clone(),
                input,
                deadline,
            });
        }

        Ok(batch)
    }

    /// Route a stage to an agent, honoring the exclusion set.
    ///
    /// When the exclusion set empties the candidate list entirely — a
    /// single-agent deployment retrying its only agent — routing falls
    /// back to the unfiltered list: re-trying a failed agent beats
    /// starving the stage forever. Returns `None` when no capable agent
    /// exists at all; the stage stays queued for a later tick.
    fn select_agent(
        &self,
        spec: &StageSpec,
        exclude: &HashSet<AgentId>,
    ) -> ArbiterResult<Option<AgentId>> {
        match self.router.route(&spec.capability, exclude) {
            Ok(agent) => Ok(Some(agent)),
            Err(ArbiterError::NoCapableAgent { .. }) if !exclude.is_empty() => {
                match self.router.route(&spec.capability, &HashSet::new()) {
                    Ok(agent) => {
                        debug!(
                            stage = %spec.name,
                            agent = %agent.0,
                            "exclusion emptied candidates; re-routing to previously failed agent"
                        );
                        Ok(Some(agent))
                    }
                    Err(ArbiterError::NoCapableAgent { .. }) => {
                        warn!(stage = %spec.name, capability = %spec.capability.0, "no capable agent; stage stays queued");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(ArbiterError::NoCapableAgent { .. }) => {
                warn!(stage = %spec.name, capability = %spec.capability.0, "no capable agent; stage stays queued");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ── Settlement ───────────────────────────────────────────────────────────

    /// Settle one in-flight attempt with `outcome` (output or error).
    ///
    /// All state mutation happens under the lock with ledger records
    /// appended first; sink delivery, cancellation signals, and follow-up
    /// dispatch are deferred until the lock is released.
    fn settle(
        &self,
        task_id: TaskId,
        outcome: Result<Value, String>,
        now: DateTime<Utc>,
    ) -> ArbiterResult<()> {
        let after = {
            let mut state = self.lock_state()?;
            let (run_id, stage) = self.locate(&state, task_id)?;
            let slot = state.runs.get_mut(&run_id).ok_or_else(|| ArbiterError::UnknownRun {
                run_id: run_id.to_string(),
            })?;
            let definition = slot.definition.clone();
            let spec = definition
                .stage(&stage)
                .ok_or_else(|| ArbiterError::StateMachineError {
                    reason: format!("task '{}' references unknown stage '{}'", task_id, stage),
                })?;

            let task = slot.tasks.get_mut(&stage).ok_or_else(|| ArbiterError::UnknownTask {
                task_id: task_id.to_string(),
            })?;

            if !matches!(task.state, TaskState::Dispatched | TaskState::Running) {
                debug!(task_id = %task_id, state = ?task.state, "stale completion ignored");
                AfterSettle::Stale
            } else {
                // Implicit acknowledgement: a completion from a Dispatched
                // task passes through Running so single-task history stays
                // strictly ordered.
                if task.state == TaskState::Dispatched {
                    ensure_legal(task, TaskState::Running)?;
                    self.ledger.record(LedgerEvent::Transition(TransitionRecord {
                        run_id,
                        task_id,
                        stage: stage.clone(),
                        from: Some(task.state),
                        to: TaskState::Running,
                        attempt: task.attempt,
                        agent: task.assigned_agent.clone(),
                        payload: None,
                        error: None,
                        timestamp: now,
                    }))?;
                    task.state = TaskState::Running;
                }

                // Success must still clear the stage's output contract.
                let outcome = match outcome {
                    Ok(output) => match &spec.output_contract {
                        Some(contract) => check_output(&stage, contract, &output)
                            .map(|_| output)
                            .map_err(|e| e.to_string()),
                        None => Ok(output),
                    },
                    Err(reason) => Err(reason),
                };

                match outcome {
                    Ok(output) => self.settle_success(run_id, slot, &stage, output, now)?,
                    Err(reason) => self.settle_failure(run_id, slot, spec, &stage, reason, now)?,
                }
            }
        };

        match after {
            AfterSettle::Stale => Ok(()),
            AfterSettle::Advance(run_id) => self.advance(run_id, now),
            AfterSettle::RunCompleted(run_id, event) => {
                info!(run_id = %run_id, "run completed");
                if let Err(e) = self.sink.deliver(&event) {
                    // Delivery is an external collaborator's concern; the
                    // payload stays retrievable from the run and ledger.
                    warn!(run_id = %run_id, error = %e, "event sink delivery failed");
                }
                Ok(())
            }
            AfterSettle::RunFailed(in_flight) => {
                for task_id in &in_flight {
                    self.connector.cancel(task_id);
                }
                Ok(())
            }
        }
    }

    /// Apply a successful settlement: snapshot the output, free the agent
    /// and lease, and decide whether the run just completed.
    fn settle_success(
        &self,
        run_id: RunId,
        slot: &mut RunSlot,
        stage: &str,
        output: Value,
        now: DateTime<Utc>,
    ) -> ArbiterResult<AfterSettle> {
        let task = slot.tasks.get_mut(stage).ok_or_else(|| ArbiterError::StateMachineError {
            reason: format!("run '{}' has no task for stage '{}'", run_id, stage),
        })?;

        ensure_legal(task, TaskState::Succeeded)?;
        self.ledger.record(LedgerEvent::Transition(TransitionRecord {
            run_id,
            task_id: task.id,
            stage: stage.to_string(),
            from: Some(task.state),
            to: TaskState::Succeeded,
            attempt: task.attempt,
            agent: task.assigned_agent.clone(),
            payload: Some(output.clone()),
            error: None,
            timestamp: now,
        }))?;

        task.state = TaskState::Succeeded;
        task.deadline = None;
        task.updated_at = now;
        if let Some(agent) = &task.assigned_agent {
            self.registry.note_completion(agent);
        }
        self.leases.release(&task.id);

        debug!(run_id = %run_id, stage, "stage succeeded");
        slot.run.outputs.insert(stage.to_string(), output);
        slot.run.updated_at = now;

        self.conclude_if_complete(run_id, slot, now)
    }

    /// Apply a failed settlement: retry with the failing agent excluded,
    /// or exhaust the stage and propagate to the run.
    fn settle_failure(
        &self,
        run_id: RunId,
        slot: &mut RunSlot,
        spec: &StageSpec,
        stage: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> ArbiterResult<AfterSettle> {
        let task = slot.tasks.get_mut(stage).ok_or_else(|| ArbiterError::StateMachineError {
            reason: format!("run '{}' has no task for stage '{}'", run_id, stage),
        })?;

        if task.attempt < self.config.max_attempts {
            // Retry: exclude the failing agent and back off.
            ensure_legal(task, TaskState::Retrying)?;
            self.ledger.record(LedgerEvent::Transition(TransitionRecord {
                run_id,
                task_id: task.id,
                stage: stage.to_string(),
                from: Some(task.state),
                to: TaskState::Retrying,
                attempt: task.attempt,
                agent: task.assigned_agent.clone(),
                payload: None,
                error: Some(reason.clone()),
                timestamp: now,
            }))?;

            warn!(
                run_id = %run_id,
                stage,
                attempt = task.attempt,
                error = %reason,
                "stage attempt failed; will retry"
            );

            let delay = retry_delay(&self.config, &task.id, task.attempt);
            task.state = TaskState::Retrying;
            task.next_eligible_at = Some(now + delay);
            task.deadline = None;
            task.last_error = Some(reason);
            task.updated_at = now;
            if let Some(agent) = task.assigned_agent.take() {
                self.registry.note_completion(&agent);
                task.excluded_agents.insert(agent);
            }
            self.leases.release(&task.id);

            return Ok(AfterSettle::Advance(run_id));
        }

        // Exhausted.
        ensure_legal(task, TaskState::Failed)?;
        self.ledger.record(LedgerEvent::Transition(TransitionRecord {
            run_id,
            task_id: task.id,
            stage: stage.to_string(),
            from: Some(task.state),
            to: TaskState::Failed,
            attempt: task.attempt,
            agent: task.assigned_agent.clone(),
            payload: None,
            error: Some(reason.clone()),
            timestamp: now,
        }))?;

        let exhausted = ArbiterError::StageExhausted {
            stage: stage.to_string(),
            capability: spec.capability.0.clone(),
            attempts: task.attempt,
        };
        warn!(run_id = %run_id, stage, error = %exhausted, last_error = %reason, "stage exhausted");

        task.state = TaskState::Failed;
        task.deadline = None;
        task.last_error = Some(reason);
        task.updated_at = now;
        if let Some(agent) = &task.assigned_agent {
            self.registry.note_completion(agent);
        }
        self.leases.release(&task.id);

        if spec.optional {
            // Downstream proceeds with a null marker in this stage's place;
            // the run may even complete if this was the last open stage.
            return self.conclude_if_complete(run_id, slot, now);
        }

        // A required stage exhausted: the run fails, remaining work is
        // cancelled, and completed upstream outputs stay retrievable.
        self.ledger.record(LedgerEvent::RunStateChanged {
            run_id,
            from: slot.run.state,
            to: RunState::Failed,
            timestamp: now,
        })?;
        slot.run.state = RunState::Failed;
        slot.run.updated_at = now;

        let in_flight = self.cancel_open_tasks(run_id, slot, now)?;
        Ok(AfterSettle::RunFailed(in_flight))
    }

    /// If every task is terminal and every required stage succeeded, mark
    /// the run `Completed` and build its terminal event.
    fn conclude_if_complete(
        &self,
        run_id: RunId,
        slot: &mut RunSlot,
        now: DateTime<Utc>,
    ) -> ArbiterResult<AfterSettle> {
        if !run_is_complete(slot) {
            return Ok(AfterSettle::Advance(run_id));
        }

        self.ledger.record(LedgerEvent::RunStateChanged {
            run_id,
            from: slot.run.state,
            to: RunState::Completed,
            timestamp: now,
        })?;
        slot.run.state = RunState::Completed;
        slot.run.updated_at = now;

        let payload = Value::Object(
            slot.run
                .outputs
                .iter()
                .map(|(stage, output)| (stage.clone(), output.clone()))
                .collect(),
        );
        Ok(AfterSettle::RunCompleted(
            run_id,
            IntelligenceEvent {
                run_id,
                definition: slot.run.definition.clone(),
                version: slot.run.version,
                payload,
                completed_at: now,
            },
        ))
    }

    /// Cancel every non-terminal task of a run. Returns the ids that were
    /// in flight and should receive a cancellation signal.
    fn cancel_open_tasks(
        &self,
        run_id: RunId,
        slot: &mut RunSlot,
        now: DateTime<Utc>,
    ) -> ArbiterResult<Vec<TaskId>> {
        let mut in_flight = Vec::new();

        for task in slot.tasks.values_mut() {
            if task.state.is_terminal() {
                continue;
            }

            ensure_legal(task, TaskState::Cancelled)?;
            self.ledger.record(LedgerEvent::Transition(TransitionRecord {
                run_id,
                task_id: task.id,
                stage: task.stage.clone(),
                from: Some(task.state),
                to: TaskState::Cancelled,
                attempt: task.attempt,
                agent: task.assigned_agent.clone(),
                payload: None,
                error: None,
                timestamp: now,
            }))?;

            if matches!(task.state, TaskState::Dispatched | TaskState::Running) {
                in_flight.push(task.id);
                if let Some(agent) = &task.assigned_agent {
                    self.registry.note_completion(agent);
                }
            }
            task.state = TaskState::Cancelled;
            task.deadline = None;
            task.updated_at = now;
            self.leases.release(&task.id);
        }

        Ok(in_flight)
    }

    // ── Recovery internals ───────────────────────────────────────────────────

    /// Rebuild one run slot from its replayed ledger events, rolling
    /// interrupted attempts back to `Retrying` for redelivery.
    fn rebuild_slot(
        &self,
        run_id: RunId,
        events: &[LedgerEvent],
        now: DateTime<Utc>,
    ) -> ArbiterResult<RunSlot> {
        let Some(LedgerEvent::RunCreated { definition, version, request, timestamp, .. }) =
            events.first()
        else {
            return Err(ArbiterError::StateMachineError {
                reason: format!("run '{}' replay does not begin with RunCreated", run_id),
            });
        };

        let definition_arc = {
            let definitions = self.lock_definitions()?;
            definitions
                .get(&(definition.clone(), *version))
                .cloned()
                .ok_or_else(|| ArbiterError::ConfigError {
                    reason: format!(
                        "cannot recover run '{}': pipeline '{}' version {} is not published",
                        run_id, definition, version
                    ),
                })?
        };

        let mut slot = RunSlot {
            run: PipelineRun {
                id: run_id,
                definition: definition.clone(),
                version: *version,
                state: RunState::Running,
                request: request.clone(),
                outputs: HashMap::new(),
                created_at: *timestamp,
                updated_at: *timestamp,
            },
            definition: definition_arc.clone(),
            tasks: HashMap::new(),
        };

        for event in &events[1..] {
            match event {
                LedgerEvent::Transition(record) if record.from.is_none() => {
                    let capability = definition_arc
                        .stage(&record.stage)
                        .map(|spec| spec.capability.clone())
                        .ok_or_else(|| ArbiterError::StateMachineError {
                            reason: format!(
                                "replayed task references unknown stage '{}'",
                                record.stage
                            ),
                        })?;
                    slot.tasks.insert(
                        record.stage.clone(),
                        Task {
                            id: record.task_id,
                            run_id,
                            stage: record.stage.clone(),
                            capability,
                            state: TaskState::Pending,
                            assigned_agent: None,
                            attempt: 0,
                            redelivery: false,
                            excluded_agents: HashSet::new(),
                            deadline: None,
                            next_eligible_at: None,
                            last_error: None,
                            created_at: record.timestamp,
                            updated_at: record.timestamp,
                        },
                    );
                }
                LedgerEvent::Transition(record) => {
                    let task = slot.tasks.get_mut(&record.stage).ok_or_else(|| {
                        ArbiterError::StateMachineError {
                            reason: format!(
                                "replayed transition for stage '{}' precedes its creation",
                                record.stage
                            ),
                        }
                    })?;
                    task.state = record.to;
                    task.attempt = record.attempt;
                    task.assigned_agent = record.agent.clone();
                    task.last_error = record.error.clone();
                    task.updated_at = record.timestamp;
                    if record.to == TaskState::Succeeded {
                        if let Some(payload) = &record.payload {
                            slot.run.outputs.insert(record.stage.clone(), payload.clone());
                        }
                    }
                }
                LedgerEvent::RunStateChanged { to, .. } => {
                    slot.run.state = *to;
                }
                _ => {}
            }
        }

        // Interrupted attempts: outcome unknown, so roll back to Retrying
        // and redeliver under the same attempt number.
        for task in slot.tasks.values_mut() {
            if matches!(task.state, TaskState::Dispatched | TaskState::Running) {
                self.ledger.record(LedgerEvent::Transition(TransitionRecord {
                    run_id,
                    task_id: task.id,
                    stage: task.stage.clone(),
                    from: Some(task.state),
                    to: TaskState::Retrying,
                    attempt: task.attempt,
                    agent: task.assigned_agent.clone(),
                    payload: None,
                    error: Some("orchestrator restart".to_string()),
                    timestamp: now,
                }))?;
                task.state = TaskState::Retrying;
                task.redelivery = true;
                task.next_eligible_at = Some(now);
                task.deadline = None;
                task.updated_at = now;
            }
        }

        Ok(slot)
    }

    // ── Lock helpers ─────────────────────────────────────────────────────────

    fn locate(&self, state: &EngineState, task_id: TaskId) -> ArbiterResult<(RunId, String)> {
        state
            .task_index
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ArbiterError::UnknownTask {
                task_id: task_id.to_string(),
            })
    }

    fn lock_state(&self) -> ArbiterResult<MutexGuard<'_, EngineState>> {
        self.state.lock().map_err(|e| ArbiterError::StateMachineError {
            reason: format!("engine state lock poisoned: {}", e),
        })
    }

    fn lock_definitions(
        &self,
    ) -> ArbiterResult<MutexGuard<'_, HashMap<(String, u32), Arc<PipelineDefinition>>>> {
        self.definitions.lock().map_err(|e| ArbiterError::StateMachineError {
            reason: format!("definition lock poisoned: {}", e),
        })
    }
}

// ── Free helpers ──────────────────────────────────────────────────────────────

/// Defense-in-depth guard on the task state machine.
///
/// Every dispatch/settlement path only produces legal transitions by
/// construction; this check turns any future violation into a
/// `StateMachineError` instead of a silently corrupted history.
fn ensure_legal(task: &Task, to: TaskState) -> ArbiterResult<()> {
    if task.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(ArbiterError::StateMachineError {
            reason: format!(
                "illegal transition {:?} → {:?} for task '{}'",
                task.state, to, task.id
            ),
        })
    }
}

/// True when every upstream dependency of `spec` has settled: `Succeeded`,
/// or `Failed` on an optional stage (its null marker stands in downstream).
fn deps_settled(
    definition: &PipelineDefinition,
    tasks: &HashMap<String, Task>,
    spec: &StageSpec,
) -> bool {
    spec.depends_on.iter().all(|dep| {
        let Some(task) = tasks.get(dep) else {
            return false;
        };
        match task.state {
            TaskState::Succeeded => true,
            TaskState::Failed => definition.stage(dep).map(|s| s.optional).unwrap_or(false),
            _ => false,
        }
    })
}

/// True when every task is terminal and every required stage succeeded.
fn run_is_complete(slot: &RunSlot) -> bool {
    slot.definition.stages.iter().all(|spec| {
        let Some(task) = slot.tasks.get(&spec.name) else {
            return false;
        };
        if !task.state.is_terminal() {
            return false;
        }
        spec.optional || task.state == TaskState::Succeeded
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::{json, Value};

    use arbiter_contracts::{
        agent::{AgentDescriptor, AgentHealth, AgentId, TrustDescriptor},
        capability::Capability,
        error::{ArbiterError, ArbiterResult},
        message::{CompletionMessage, CompletionStatus, DispatchEnvelope, IntelligenceEvent},
        pipeline::{InputMapping, OutputContract, PipelineDefinition, RunState, StageSpec},
        principal::PrincipalId,
        task::{TaskId, TaskState},
    };
    use arbiter_ledger::{InMemoryLedger, Ledger, LedgerEvent};
    use arbiter_registry::{AgentRegistry, RegistryConfig};

    use crate::{
        traits::{AgentConnector, EventSink},
        EngineConfig,
    };

    use super::PipelineEngine;

    // ── Mock helpers ─────────────────────────────────────────────────────────

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// A ledger that can be armed to fail every write, for exercising the
    /// durability invariant.
    struct FlakyLedger {
        inner: InMemoryLedger,
        fail: AtomicBool,
    }

    impl FlakyLedger {
        fn new() -> Self {
            Self {
                inner: InMemoryLedger::new(),
                fail: AtomicBool::new(false),
            }
        }

        fn arm(&self) {
            self.fail.store(true, Ordering::SeqCst);
        }

        fn disarm(&self) {
            self.fail.store(false, Ordering::SeqCst);
        }
    }

    impl Ledger for FlakyLedger {
        fn record(&self, event: LedgerEvent) -> ArbiterResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ArbiterError::LedgerWriteFailure {
                    reason: "injected storage failure".to_string(),
                });
            }
            self.inner.record(event)
        }

        fn replay(
            &self,
            run_id: &arbiter_contracts::pipeline::RunId,
        ) -> ArbiterResult<Vec<LedgerEvent>> {
            self.inner.replay(run_id)
        }

        fn open_runs(&self) -> ArbiterResult<Vec<arbiter_contracts::pipeline::RunId>> {
            self.inner.open_runs()
        }
    }

    /// A connector that records every envelope and cancellation.
    struct RecordingConnector {
        envelopes: Arc<Mutex<Vec<DispatchEnvelope>>>,
        cancelled: Arc<Mutex<Vec<TaskId>>>,
    }

    impl AgentConnector for RecordingConnector {
        fn dispatch(&self, envelope: &DispatchEnvelope) -> ArbiterResult<()> {
            self.envelopes.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        fn cancel(&self, task_id: &TaskId) {
            self.cancelled.lock().unwrap().push(*task_id);
        }
    }

    /// A sink that records every delivered event.
    struct RecordingSink {
        events: Arc<Mutex<Vec<IntelligenceEvent>>>,
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, event: &IntelligenceEvent) -> ArbiterResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        engine: PipelineEngine,
        registry: Arc<AgentRegistry>,
        ledger: Arc<FlakyLedger>,
        envelopes: Arc<Mutex<Vec<DispatchEnvelope>>>,
        cancelled: Arc<Mutex<Vec<TaskId>>>,
        events: Arc<Mutex<Vec<IntelligenceEvent>>>,
    }

    impl Harness {
        /// Drain and return the envelopes dispatched since the last call.
        fn take_envelopes(&self) -> Vec<DispatchEnvelope> {
            std::mem::take(&mut *self.envelopes.lock().unwrap())
        }

        fn complete_ok(&self, task_id: TaskId, output: Value, now: chrono::DateTime<Utc>) {
            self.engine
                .complete(
                    CompletionMessage {
                        task_id,
                        status: CompletionStatus::Success { output },
                    },
                    now,
                )
                .unwrap();
        }

        fn complete_err(&self, task_id: TaskId, error: &str, now: chrono::DateTime<Utc>) {
            self.engine
                .complete(
                    CompletionMessage {
                        task_id,
                        status: CompletionStatus::Failure {
                            error: error.to_string(),
                        },
                    },
                    now,
                )
                .unwrap();
        }

        fn register_agent(&self, name: &str, capability: &str) {
            let id = self
                .registry
                .register(
                    AgentDescriptor {
                        id: AgentId::new(name),
                        capabilities: [Capability::new(capability)].into_iter().collect(),
                        trust: TrustDescriptor {
                            principal_id: PrincipalId::new(format!("agent:{name}")),
                        },
                    },
                    t0(),
                )
                .unwrap();
            self.registry.heartbeat(&id, AgentHealth::Healthy, t0()).unwrap();
        }
    }

    /// Build an engine with zero backoff (retries re-dispatch immediately)
    /// and the default three-attempt ceiling.
    fn harness_with_ledger(agents: &[(&str, &str)], ledger: Arc<FlakyLedger>) -> Harness {
        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig::default(),
            ledger.clone() as Arc<dyn Ledger>,
        ));

        let envelopes = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let engine = PipelineEngine::new(
            EngineConfig {
                max_attempts: 3,
                dispatch_timeout: Duration::seconds(60),
                base_backoff: Duration::zero(),
                max_backoff: Duration::zero(),
                lease_ttl: Duration::seconds(30),
            },
            registry.clone(),
            ledger.clone() as Arc<dyn Ledger>,
            Box::new(RecordingConnector {
                envelopes: envelopes.clone(),
                cancelled: cancelled.clone(),
            }),
            Box::new(RecordingSink {
                events: events.clone(),
            }),
        );

        let harness = Harness {
            engine,
            registry,
            ledger,
            envelopes,
            cancelled,
            events,
        };
        for (name, capability) in agents {
            harness.register_agent(name, capability);
        }
        harness
    }

    fn harness(agents: &[(&str, &str)]) -> Harness {
        harness_with_ledger(agents, Arc::new(FlakyLedger::new()))
    }

    const FULL_CREW: &[(&str, &str)] = &[
        ("scout-1", "identify-competitors"),
        ("research-1", "enrich-entity"),
        ("synth-1", "synthesize-report"),
    ];

    fn stage(name: &str, capability: &str, depends_on: &[&str], mapping: InputMapping) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            capability: Capability::new(capability),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            mapping,
            optional: false,
            output_contract: None,
        }
    }

    /// Scout → Research → Synthesizer, straight line.
    fn linear_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "competitor-digest".to_string(),
            version: 1,
            stages: vec![
                stage("scout", "identify-competitors", &[], InputMapping::Request),
                stage(
                    "research",
                    "enrich-entity",
                    &["scout"],
                    InputMapping::Output { stage: "scout".to_string() },
                ),
                stage("synthesize", "synthesize-report", &["research"], InputMapping::Merge),
            ],
        }
    }

    /// Scout fans out to two research stages that fan back in.
    fn fan_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "competitor-digest".to_string(),
            version: 2,
            stages: vec![
                stage("scout", "identify-competitors", &[], InputMapping::Request),
                stage(
                    "research-a",
                    "enrich-entity",
                    &["scout"],
                    InputMapping::Pointer {
                        stage: "scout".to_string(),
                        pointer: "/competitors/0".to_string(),
                    },
                ),
                stage(
                    "research-b",
                    "enrich-entity",
                    &["scout"],
                    InputMapping::Pointer {
                        stage: "scout".to_string(),
                        pointer: "/competitors/1".to_string(),
                    },
                ),
                stage(
                    "synthesize",
                    "synthesize-report",
                    &["research-a", "research-b"],
                    InputMapping::Merge,
                ),
            ],
        }
    }

    // ── Test cases ───────────────────────────────────────────────────────────

    /// The canonical scenario: Scout finds competitors, Research enriches,
    /// Synthesizer merges — the run completes with the synthesized payload
    /// recorded and delivered to the sink.
    #[test]
    fn test_linear_pipeline_completes() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();

        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        // Only the entry stage is dispatched; its input is the request.
        let batch = h.take_envelopes();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].capability, Capability::new("identify-competitors"));
        assert_eq!(batch[0].input, json!({ "company": "Acme" }));

        h.complete_ok(batch[0].task_id, json!({ "competitors": ["A", "B"] }), t0());

        // Research receives the scout output verbatim (Output mapping).
        let batch = h.take_envelopes();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].input, json!({ "competitors": ["A", "B"] }));
        h.complete_ok(batch[0].task_id, json!({ "profiles": ["a", "b"] }), t0());

        // Synthesizer receives the merge keyed by stage name.
        let batch = h.take_envelopes();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].input, json!({ "research": { "profiles": ["a", "b"] } }));
        h.complete_ok(batch[0].task_id, json!({ "digest": "Acme faces A and B" }), t0());

        let report = h.engine.run_report(run_id).unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(report.failure.is_none());
        assert_eq!(report.outputs["synthesize"], json!({ "digest": "Acme faces A and B" }));

        // The terminal event carries every stage output.
        let events = h.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id, run_id);
        assert_eq!(events[0].payload["scout"], json!({ "competitors": ["A", "B"] }));
        assert_eq!(events[0].payload["synthesize"], json!({ "digest": "Acme faces A and B" }));
    }

    /// Fan-out dispatches both branches concurrently; fan-in waits for the
    /// full barrier before constructing the merged input.
    #[test]
    fn test_fan_out_fan_in_barrier() {
        let h = harness(FULL_CREW);
        h.engine.publish(fan_definition()).unwrap();

        let run_id = h
            .engine
            .start_run("competitor-digest", 2, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.complete_ok(scout.task_id, json!({ "competitors": ["A", "B"] }), t0());

        // Both research branches dispatch together, each with its pointer
        // selection from the scout output.
        let batch = h.take_envelopes();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].input, json!("A"));
        assert_eq!(batch[1].input, json!("B"));

        // One branch done: the barrier holds, nothing new dispatches.
        h.complete_ok(batch[0].task_id, json!({ "name": "A", "domain": "a.com" }), t0());
        assert!(h.take_envelopes().is_empty());

        // Second branch done: the barrier releases with the merged input.
        h.complete_ok(batch[1].task_id, json!({ "name": "B", "domain": "b.com" }), t0());
        let synth = h.take_envelopes().remove(0);
        assert_eq!(
            synth.input,
            json!({
                "research-a": { "name": "A", "domain": "a.com" },
                "research-b": { "name": "B", "domain": "b.com" },
            })
        );

        h.complete_ok(synth.task_id, json!({ "digest": "two rivals" }), t0());
        assert_eq!(h.engine.run_report(run_id).unwrap().state, RunState::Completed);
    }

    /// A research agent fails twice and succeeds on the third attempt: the
    /// task ends Succeeded with attempt_count = 3, not Retrying, and the
    /// sole agent is re-selected once the exclusion set empties the
    /// candidate list.
    #[test]
    fn test_retry_then_success_attempt_counts() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.complete_ok(scout.task_id, json!({ "competitors": ["A"] }), t0());

        // Attempt 1 fails; zero backoff re-dispatches immediately.
        let attempt1 = h.take_envelopes().remove(0);
        assert_eq!(attempt1.attempt, 1);
        h.complete_err(attempt1.task_id, "upstream API 502", t0());

        let attempt2 = h.take_envelopes().remove(0);
        assert_eq!(attempt2.attempt, 2);
        assert_eq!(attempt2.task_id, attempt1.task_id, "retries reuse the stable task id");
        h.complete_err(attempt2.task_id, "upstream API 502", t0());

        let attempt3 = h.take_envelopes().remove(0);
        assert_eq!(attempt3.attempt, 3);
        h.complete_ok(attempt3.task_id, json!({ "profiles": ["a"] }), t0());

        let task = h.engine.task(attempt3.task_id).unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.attempt, 3);

        // The run is still live and proceeds to synthesis.
        let synth = h.take_envelopes().remove(0);
        h.complete_ok(synth.task_id, json!({ "digest": "d" }), t0());
        assert_eq!(h.engine.run_report(run_id).unwrap().state, RunState::Completed);
    }

    /// Exhausting a required stage fails the run, cancels the remaining
    /// work, and preserves the completed upstream outputs.
    #[test]
    fn test_exhaustion_fails_run_preserves_upstream() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.complete_ok(scout.task_id, json!({ "competitors": ["A", "B"] }), t0());

        for _ in 0..3 {
            let envelope = h.take_envelopes().remove(0);
            h.complete_err(envelope.task_id, "model overloaded", t0());
        }

        let report = h.engine.run_report(run_id).unwrap();
        assert_eq!(report.state, RunState::Failed);

        // The failure names the stage, capability, and last error kind.
        let failure = report.failure.expect("failed run must report its failing stage");
        assert_eq!(failure.stage, "research");
        assert_eq!(failure.capability, Capability::new("enrich-entity"));
        assert!(failure.error.contains("model overloaded"));

        // Partial results from completed upstream stages stay retrievable.
        assert_eq!(report.outputs["scout"], json!({ "competitors": ["A", "B"] }));

        // The pending synthesis task was cancelled, and nothing dispatches
        // for a failed run.
        h.engine.tick(t0() + Duration::seconds(1)).unwrap();
        assert!(h.take_envelopes().is_empty());
        assert!(h.events.lock().unwrap().is_empty(), "no terminal event for a failed run");
    }

    /// An optional stage that exhausts its retries does not fail the run;
    /// downstream proceeds with an explicit null marker in its place.
    #[test]
    fn test_optional_stage_failure_proceeds_with_null() {
        let h = harness(FULL_CREW);
        let mut definition = linear_definition();
        definition.stages[1].optional = true;
        definition.stages[2].depends_on = vec!["scout".to_string(), "research".to_string()];
        h.engine.publish(definition).unwrap();

        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.complete_ok(scout.task_id, json!({ "competitors": ["A"] }), t0());

        for _ in 0..3 {
            let envelope = h.take_envelopes().remove(0);
            h.complete_err(envelope.task_id, "enrichment source down", t0());
        }

        // The merge carries the null marker for the failed optional stage.
        let synth = h.take_envelopes().remove(0);
        assert_eq!(
            synth.input,
            json!({ "scout": { "competitors": ["A"] }, "research": null })
        );

        h.complete_ok(synth.task_id, json!({ "digest": "partial" }), t0());
        let report = h.engine.run_report(run_id).unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(report.failure.is_none(), "an optional failure is not a run failure");
    }

    /// Exceeding the dispatch deadline is treated identically to an
    /// agent-reported failure: the attempt is consumed and the stage
    /// re-dispatches.
    #[test]
    fn test_deadline_timeout_retries() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        h.engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let attempt1 = h.take_envelopes().remove(0);
        assert_eq!(attempt1.attempt, 1);
        assert_eq!(attempt1.deadline, t0() + Duration::seconds(60));

        // Within the deadline nothing happens.
        h.engine.tick(t0() + Duration::seconds(59)).unwrap();
        assert!(h.take_envelopes().is_empty());

        // Past the deadline the attempt fails and re-dispatches.
        h.engine.tick(t0() + Duration::seconds(61)).unwrap();
        let attempt2 = h.take_envelopes().remove(0);
        assert_eq!(attempt2.task_id, attempt1.task_id);
        assert_eq!(attempt2.attempt, 2);

        let task = h.engine.task(attempt2.task_id).unwrap();
        assert!(task.last_error.as_deref().unwrap_or_default().contains("deadline"));
    }

    /// Cancelling a run cancels every non-terminal task, signals in-flight
    /// agents, and stops all further dispatch.
    #[test]
    fn test_cancel_run() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.engine.cancel_run(run_id, t0()).unwrap();

        // The in-flight scout received the best-effort signal.
        assert_eq!(*h.cancelled.lock().unwrap(), vec![scout.task_id]);
        assert_eq!(h.engine.run_report(run_id).unwrap().state, RunState::Cancelled);
        assert_eq!(h.engine.task(scout.task_id).unwrap().state, TaskState::Cancelled);

        // A late completion from the cancelled agent is ignored, and no
        // new dispatch ever happens for the run.
        h.complete_ok(scout.task_id, json!({ "competitors": [] }), t0());
        h.engine.tick(t0() + Duration::seconds(1)).unwrap();
        assert!(h.take_envelopes().is_empty());

        // Cancellation is idempotent.
        h.engine.cancel_run(run_id, t0()).unwrap();
    }

    /// At most one in-flight dispatch exists per task: the lease is held
    /// from dispatch until settlement, and repeated advance/tick passes
    /// never duplicate an envelope.
    #[test]
    fn test_dispatch_lease_exclusivity() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        let run_id = h
            .engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        assert!(h.engine.leases.is_held(&scout.task_id, t0()));

        h.engine.advance(run_id, t0()).unwrap();
        h.engine.tick(t0()).unwrap();
        assert!(h.take_envelopes().is_empty(), "no duplicate dispatch while leased");

        h.complete_ok(scout.task_id, json!({ "competitors": [] }), t0());
        assert!(!h.engine.leases.is_held(&scout.task_id, t0()));
    }

    /// A ledger write failure blocks the transition: the completion errors,
    /// the task stays in its prior state, and the same signal succeeds once
    /// the ledger recovers.
    #[test]
    fn test_ledger_failure_blocks_transition() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        h.engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.engine.acknowledge(scout.task_id, t0()).unwrap();

        h.ledger.arm();
        let result = h.engine.complete(
            CompletionMessage {
                task_id: scout.task_id,
                status: CompletionStatus::Success {
                    output: json!({ "competitors": ["A"] }),
                },
            },
            t0(),
        );
        assert!(matches!(result, Err(ArbiterError::LedgerWriteFailure { .. })));

        // Forward progress is blocked: still Running, output not recorded.
        let task = h.engine.task(scout.task_id).unwrap();
        assert_eq!(task.state, TaskState::Running);

        // Once the ledger recovers, the retried signal lands.
        h.ledger.disarm();
        h.complete_ok(scout.task_id, json!({ "competitors": ["A"] }), t0());
        assert_eq!(h.engine.task(scout.task_id).unwrap().state, TaskState::Succeeded);
    }

    /// Crash recovery: a second engine rebuilds the run from the shared
    /// ledger and redelivers the interrupted attempt under the same task id
    /// and attempt number, so agent-side deduplication holds.
    #[test]
    fn test_recover_redelivers_in_flight() {
        let ledger = Arc::new(FlakyLedger::new());

        let run_id = {
            let h1 = harness_with_ledger(FULL_CREW, ledger.clone());
            h1.engine.publish(linear_definition()).unwrap();
            let run_id = h1
                .engine
                .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
                .unwrap();
            let scout = h1.take_envelopes().remove(0);
            assert_eq!(scout.attempt, 1);
            // The orchestrator "crashes" here with scout in flight.
            run_id
        };

        let h2 = harness_with_ledger(FULL_CREW, ledger);
        h2.engine.publish(linear_definition()).unwrap();

        let recovered = h2.engine.recover(t0() + Duration::seconds(5)).unwrap();
        assert_eq!(recovered, vec![run_id]);

        // The interrupted attempt is redelivered, not double-counted.
        let scout = h2.take_envelopes().remove(0);
        assert_eq!(scout.attempt, 1);

        h2.complete_ok(scout.task_id, json!({ "competitors": ["A"] }), t0() + Duration::seconds(6));
        let research = h2.take_envelopes().remove(0);
        h2.complete_ok(research.task_id, json!({ "profiles": ["a"] }), t0() + Duration::seconds(7));
        let synth = h2.take_envelopes().remove(0);
        h2.complete_ok(synth.task_id, json!({ "digest": "d" }), t0() + Duration::seconds(8));

        assert_eq!(h2.engine.run_report(run_id).unwrap().state, RunState::Completed);
    }

    /// With no capable agent available, the stage stays queued without
    /// consuming attempts and dispatches as soon as one appears.
    #[test]
    fn test_stage_queued_until_agent_available() {
        let h = harness(&[]);
        h.engine.publish(linear_definition()).unwrap();
        h.engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        assert!(h.take_envelopes().is_empty());

        h.register_agent("scout-1", "identify-competitors");
        h.engine.tick(t0() + Duration::seconds(1)).unwrap();

        let scout = h.take_envelopes().remove(0);
        assert_eq!(scout.attempt, 1, "queueing must not consume attempts");
    }

    /// An output-contract violation consumes the attempt like any other
    /// failure, and a conforming retry succeeds.
    #[test]
    fn test_contract_violation_counts_as_failure() {
        let h = harness(FULL_CREW);
        let mut definition = linear_definition();
        definition.stages[0].output_contract = Some(OutputContract {
            contract_id: "competitor-list-v1".to_string(),
            json_schema: json!({
                "type": "object",
                "required": ["competitors"],
            }),
        });
        h.engine.publish(definition).unwrap();
        h.engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let attempt1 = h.take_envelopes().remove(0);
        h.complete_ok(attempt1.task_id, json!({ "wrong_shape": true }), t0());

        // The malformed output never reached downstream; the stage retried.
        let attempt2 = h.take_envelopes().remove(0);
        assert_eq!(attempt2.task_id, attempt1.task_id);
        assert_eq!(attempt2.attempt, 2);

        h.complete_ok(attempt2.task_id, json!({ "competitors": ["A"] }), t0());
        assert_eq!(h.engine.task(attempt2.task_id).unwrap().state, TaskState::Succeeded);
    }

    /// Acknowledgements record the Dispatched → Running transition.
    #[test]
    fn test_acknowledge_records_running() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        h.engine
            .start_run("competitor-digest", 1, json!({ "company": "Acme" }), t0())
            .unwrap();

        let scout = h.take_envelopes().remove(0);
        h.engine.acknowledge(scout.task_id, t0()).unwrap();
        assert_eq!(h.engine.task(scout.task_id).unwrap().state, TaskState::Running);

        // A second acknowledgement is stale and harmless.
        h.engine.acknowledge(scout.task_id, t0()).unwrap();
    }

    /// Completion signals for unknown tasks are an error, not a silent drop.
    #[test]
    fn test_unknown_task_completion() {
        let h = harness(FULL_CREW);
        let result = h.engine.complete(
            CompletionMessage {
                task_id: TaskId::new(),
                status: CompletionStatus::Failure {
                    error: "whatever".to_string(),
                },
            },
            t0(),
        );
        assert!(matches!(result, Err(ArbiterError::UnknownTask { .. })));
    }

    /// Starting a run for an unpublished definition fails.
    #[test]
    fn test_start_run_unknown_definition() {
        let h = harness(FULL_CREW);
        let result = h.engine.start_run("ghost-pipeline", 1, json!({}), t0());
        assert!(matches!(result, Err(ArbiterError::ConfigError { .. })));
    }

    /// Definitions are immutable once published: the same (name, version)
    /// cannot be republished.
    #[test]
    fn test_publish_duplicate_version() {
        let h = harness(FULL_CREW);
        h.engine.publish(linear_definition()).unwrap();
        let result = h.engine.publish(linear_definition());
        assert!(matches!(result, Err(ArbiterError::ConfigError { .. })));
    }
}
