pub mod run_store;

pub use run_store::{RunRecord, RunState, RunStore, RunStoreError, StepRecord};

use crate::approval::ApprovalGate;
use crate::capability::{CapabilityError, InvocationScope, ToolInvocation, ToolRegistry};
use crate::engine::{EngineAction, EngineExchange, EngineRequest, ReasoningEngine};
use crate::events::{EventPayload, EventStream};
use crate::scan::{sites_from_answer, ScanArtifact, ScanStore, ScanStoreError};
use crate::shared::ids::{RunId, StepId};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Upper bound on tool round-trips a single step may issue before it is
/// failed for running away.
const MAX_TOOL_CALLS_PER_STEP: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("run already terminated; a fresh orchestrator is required per run")]
    AlreadyTerminated,
    #[error("capability failure: {0}")]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Store(#[from] RunStoreError),
    #[error("scan artifact failure: {0}")]
    Scan(#[from] ScanStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }

    pub fn can_transition_to(self, next: StepState) -> bool {
        matches!(
            (self, next),
            (StepState::Pending, StepState::Running)
                | (StepState::Pending, StepState::Skipped)
                | (StepState::Running, StepState::WaitingApproval)
                | (StepState::Running, StepState::Completed)
                | (StepState::Running, StepState::Failed)
                | (StepState::WaitingApproval, StepState::Running)
                | (StepState::WaitingApproval, StepState::Failed)
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::Running => write!(f, "running"),
            StepState::WaitingApproval => write!(f, "waiting_approval"),
            StepState::Completed => write!(f, "completed"),
            StepState::Failed => write!(f, "failed"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Shared view of every step's lifecycle state. Transitions are checked
/// against the state machine; each accepted transition is published as a
/// StepStatusChanged event.
#[derive(Debug, Clone)]
pub struct StepBoard {
    states: Arc<Mutex<Vec<(StepId, StepState)>>>,
    events: EventStream,
}

impl StepBoard {
    pub fn new(events: EventStream, step_ids: impl IntoIterator<Item = StepId>) -> Self {
        Self {
            states: Arc::new(Mutex::new(
                step_ids
                    .into_iter()
                    .map(|id| (id, StepState::Pending))
                    .collect(),
            )),
            events,
        }
    }

    /// Applies a transition if the state machine allows it; returns whether
    /// the board changed. Same-state calls are accepted no-ops.
    pub fn set_state(&self, step_id: &StepId, next: StepState) -> bool {
        let mut states = self.states.lock().expect("step board lock");
        let Some(entry) = states.iter_mut().find(|(id, _)| id == step_id) else {
            return false;
        };
        let current = entry.1;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            return false;
        }
        entry.1 = next;
        drop(states);
        self.events.publish(
            Some(step_id),
            EventPayload::StepStatusChanged {
                from: current.to_string(),
                to: next.to_string(),
            },
        );
        true
    }

    pub fn state(&self, step_id: &StepId) -> Option<StepState> {
        self.states
            .lock()
            .expect("step board lock")
            .iter()
            .find(|(id, _)| id == step_id)
            .map(|(_, state)| *state)
    }

    pub fn snapshot(&self) -> Vec<(StepId, StepState)> {
        self.states.lock().expect("step board lock").clone()
    }

    pub fn completed_count(&self) -> usize {
        self.states
            .lock()
            .expect("step board lock")
            .iter()
            .filter(|(_, state)| *state == StepState::Completed)
            .count()
    }

    pub fn current_step(&self) -> Option<StepId> {
        self.states
            .lock()
            .expect("step board lock")
            .iter()
            .find(|(_, state)| matches!(state, StepState::Running | StepState::WaitingApproval))
            .map(|(id, _)| id.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub id: StepId,
    pub instruction: String,
    /// Capabilities this step may invoke; everything else is refused.
    pub capabilities: BTreeSet<String>,
    pub continue_on_failure: bool,
    pub depends_on: Vec<StepId>,
    /// Persist the step's final answer as the write-once scan artifact.
    pub records_scan: bool,
}

impl PipelineStep {
    pub fn new(id: StepId, instruction: impl Into<String>) -> Self {
        Self {
            id,
            instruction: instruction.into(),
            capabilities: BTreeSet::new(),
            continue_on_failure: false,
            depends_on: Vec::new(),
            records_scan: false,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_continue_on_failure(mut self, flag: bool) -> Self {
        self.continue_on_failure = flag;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<StepId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_records_scan(mut self, flag: bool) -> Self {
        self.records_scan = flag;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub total_steps: usize,
    pub completed: usize,
    pub current_step: Option<String>,
    pub outstanding_approvals: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_state: RunState,
    pub steps: Vec<(StepId, StepState)>,
}

enum StepVerdict {
    Completed,
    Failed,
}

/// Drives the migration pipeline: one step at a time, each step an
/// engine-proposed sequence of capability calls, side effects held behind
/// the approval gate. Single-shot; re-running a terminated run fails.
pub struct Orchestrator {
    run_id: RunId,
    workspace_root: PathBuf,
    steps: Vec<PipelineStep>,
    engine: Arc<dyn ReasoningEngine>,
    events: EventStream,
    gate: ApprovalGate,
    registry: ToolRegistry,
    board: StepBoard,
    run_store: RunStore,
    scan_store: ScanStore,
    sequence: AtomicU64,
    started: AtomicBool,
    abort_requested: Arc<AtomicBool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        workspace_root: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
        steps: Vec<PipelineStep>,
        engine: Arc<dyn ReasoningEngine>,
        events: EventStream,
        gate: ApprovalGate,
        registry: ToolRegistry,
    ) -> Self {
        let state_root = state_root.into();
        let board = StepBoard::new(events.clone(), steps.iter().map(|step| step.id.clone()));
        Self {
            run_id,
            workspace_root: workspace_root.into(),
            steps,
            engine,
            events,
            gate,
            registry,
            board,
            run_store: RunStore::new(&state_root),
            scan_store: ScanStore::new(&state_root),
            sequence: AtomicU64::new(1),
            started: AtomicBool::new(false),
            abort_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn board(&self) -> &StepBoard {
        &self.board
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            total_steps: self.steps.len(),
            completed: self.board.completed_count(),
            current_step: self.board.current_step().map(|id| id.to_string()),
            outstanding_approvals: self.gate.pending_count(),
        }
    }

    /// Requests a stop: the current step fails, every outstanding approval
    /// resolves Rejected, and no further step starts. Applied writes are
    /// never rolled back.
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.gate.reject_outstanding();
    }

    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyTerminated);
        }

        let step_ids: Vec<String> = self.steps.iter().map(|step| step.id.to_string()).collect();
        let mut record = RunRecord::new(
            &self.run_id,
            self.workspace_root.display().to_string(),
            &step_ids,
        );
        self.run_store.save(&record)?;

        let mut halted = false;
        let mut aborted = false;
        for step in &self.steps {
            if halted || aborted {
                break;
            }
            if self.abort_requested.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            if self.dependency_blocked(step) {
                self.board.set_state(&step.id, StepState::Skipped);
                self.persist(&mut record, RunState::Running)?;
                continue;
            }

            self.board.set_state(&step.id, StepState::Running);
            self.persist(&mut record, RunState::Running)?;

            let verdict = match self.run_step(step) {
                Ok(verdict) => verdict,
                Err(err) => {
                    // Even a fatal error leaves the step and run record in a
                    // terminal, queryable state.
                    self.board.set_state(&step.id, StepState::Failed);
                    self.persist(&mut record, RunState::Failed)?;
                    return Err(err);
                }
            };
            match verdict {
                StepVerdict::Completed => {
                    self.board.set_state(&step.id, StepState::Completed);
                }
                StepVerdict::Failed => {
                    self.board.set_state(&step.id, StepState::Failed);
                    if self.abort_requested.load(Ordering::SeqCst) {
                        aborted = true;
                    } else if !step.continue_on_failure {
                        halted = true;
                    }
                }
            }
            self.persist(&mut record, RunState::Running)?;
        }

        let snapshot = self.board.snapshot();
        let run_state = if aborted {
            RunState::Aborted
        } else if snapshot
            .iter()
            .any(|(_, state)| *state == StepState::Failed)
        {
            RunState::Failed
        } else {
            RunState::Completed
        };
        self.persist(&mut record, run_state)?;
        Ok(RunSummary {
            run_state,
            steps: snapshot,
        })
    }

    fn dependency_blocked(&self, step: &PipelineStep) -> bool {
        step.depends_on.iter().any(|dep| {
            matches!(
                self.board.state(dep),
                Some(StepState::Failed) | Some(StepState::Skipped)
            )
        })
    }

    fn run_step(&self, step: &PipelineStep) -> Result<StepVerdict, PipelineError> {
        let mut history: Vec<EngineExchange> = Vec::new();
        for _ in 0..MAX_TOOL_CALLS_PER_STEP {
            if self.abort_requested.load(Ordering::SeqCst) {
                return Ok(StepVerdict::Failed);
            }

            let request = EngineRequest {
                step_id: step.id.to_string(),
                instruction: step.instruction.clone(),
                history: history.clone(),
            };
            let action = match self.engine.propose_next_action(&request) {
                Ok(action) => action,
                Err(err) => {
                    self.emit_error(&step.id, &format!("engine error: {err}"));
                    return Ok(StepVerdict::Failed);
                }
            };

            match action {
                EngineAction::FinalAnswer { text } => {
                    if step.records_scan {
                        self.record_scan(&step.id, &text)?;
                    }
                    self.events.publish(
                        Some(&step.id),
                        EventPayload::Message { text },
                    );
                    return Ok(StepVerdict::Completed);
                }
                EngineAction::ToolCall { capability, args } => {
                    let invocation = ToolInvocation {
                        sequence_id: self.sequence.fetch_add(1, Ordering::SeqCst),
                        step_id: step.id.clone(),
                        capability,
                        args,
                    };
                    let scope = InvocationScope {
                        step_id: &step.id,
                        allowed: Some(&step.capabilities),
                        board: Some(&self.board),
                    };
                    match self.registry.invoke(&scope, &invocation) {
                        Ok(result) => history.push(EngineExchange {
                            capability: invocation.capability,
                            args: invocation.args,
                            result,
                        }),
                        Err(err) if err.is_fatal() => {
                            self.emit_error(&step.id, &err.to_string());
                            return Err(PipelineError::Capability(err));
                        }
                        Err(CapabilityError::Gate(err)) => {
                            self.emit_error(&step.id, &err.to_string());
                            return Err(PipelineError::Capability(CapabilityError::Gate(err)));
                        }
                        // Denials, stale bases, and bad arguments go back to
                        // the engine; it decides whether to retry, adjust, or
                        // wrap up.
                        Err(err) => {
                            self.emit_error(&step.id, &err.to_string());
                            history.push(EngineExchange {
                                capability: invocation.capability,
                                args: invocation.args,
                                result: json!({ "error": err.to_string() }),
                            });
                        }
                    }
                }
            }
        }

        self.emit_error(
            &step.id,
            &format!("tool call budget of {MAX_TOOL_CALLS_PER_STEP} exhausted"),
        );
        Ok(StepVerdict::Failed)
    }

    fn record_scan(&self, step_id: &StepId, answer: &str) -> Result<(), PipelineError> {
        let artifact = ScanArtifact::new(
            &self.run_id,
            self.workspace_root.display().to_string(),
            answer,
            sites_from_answer(answer),
        );
        match self.scan_store.record(&artifact) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.emit_error(step_id, &err.to_string());
                Err(PipelineError::Scan(err))
            }
        }
    }

    fn persist(&self, record: &mut RunRecord, run_state: RunState) -> Result<(), PipelineError> {
        record.state = run_state;
        record.updated_at = crate::shared::logging::now_secs();
        let snapshot = self.board.snapshot();
        for step_record in &mut record.steps {
            if let Some((_, state)) = snapshot
                .iter()
                .find(|(id, _)| id.as_str() == step_record.id)
            {
                step_record.state = *state;
            }
        }
        self.run_store.save(record)?;
        Ok(())
    }

    fn emit_error(&self, step_id: &StepId, message: &str) {
        self.events.publish(
            Some(step_id),
            EventPayload::Error {
                message: message.to_string(),
            },
        );
    }
}
