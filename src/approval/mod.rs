use crate::events::{EventPayload, EventStream};
use crate::shared::ids::{RunId, StepId};
use crate::shared::logging::{append_audit_record, audit_log_path, now_secs};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const APPROVE_TOKENS: &[&str] = &["y", "yes", "approve", "ok", "apply"];
pub const REJECT_TOKENS: &[&str] = &["n", "no", "reject", "skip", "cancel"];
pub const APPROVE_ALL_TOKENS: &[&str] = &["all"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    ApprovedAll,
}

impl Decision {
    pub fn approves(self) -> bool {
        matches!(self, Decision::Approved | Decision::ApprovedAll)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
            Decision::ApprovedAll => write!(f, "approved_all"),
        }
    }
}

/// Maps normalized operator input to a decision. `None` means the token was
/// not recognized; the pending request is untouched and the caller should
/// re-prompt rather than default to approve or reject.
pub fn parse_decision_text(input: &str) -> Option<Decision> {
    let token = input.trim().to_ascii_lowercase();
    if APPROVE_TOKENS.contains(&token.as_str()) {
        Some(Decision::Approved)
    } else if REJECT_TOKENS.contains(&token.as_str()) {
        Some(Decision::Rejected)
    } else if APPROVE_ALL_TOKENS.contains(&token.as_str()) {
        Some(Decision::ApprovedAll)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    FileWrite,
    CommandExecution,
}

impl std::fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalKind::FileWrite => write!(f, "file_write"),
            ApprovalKind::CommandExecution => write!(f, "command_execution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub request_id: u64,
    pub step_id: StepId,
    pub kind: ApprovalKind,
    /// File path or command line under review.
    pub subject: String,
    /// Rendered diff or command description shown to the operator.
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub request_id: u64,
    pub decision: Decision,
    pub auto: bool,
    pub timed_out: bool,
}

impl ApprovalOutcome {
    pub fn approved(&self) -> bool {
        self.decision.approves()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("approval request {request_id} not found or already resolved")]
    UnknownRequest { request_id: u64 },
    #[error("audit log append failed at {path}: {source}")]
    Audit {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct PendingEntry {
    request: ApprovalRequest,
    decision: Option<Decision>,
    auto: bool,
}

#[derive(Debug)]
struct GateState {
    next_request_id: u64,
    blanket: bool,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
    decided: Condvar,
    events: EventStream,
    state_root: PathBuf,
    run_id: RunId,
    unattended: bool,
    timeout: Option<Duration>,
}

/// Suspension/decision protocol guarding side-effecting capabilities. Each
/// request moves `Created -> {Approved | Rejected | ApprovedAll}` exactly
/// once; `ApprovedAll` flips the gate into blanket mode for the rest of the
/// run. Every transition is published on the event stream and appended to
/// the per-run audit log.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    inner: Arc<GateInner>,
}

impl ApprovalGate {
    pub fn new(events: EventStream, state_root: impl Into<PathBuf>, run_id: RunId) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    next_request_id: 1,
                    blanket: false,
                    pending: BTreeMap::new(),
                }),
                decided: Condvar::new(),
                events,
                state_root: state_root.into(),
                run_id,
                unattended: false,
                timeout: None,
            }),
        }
    }

    /// Unattended policy: every request resolves Approved at creation
    /// without suspending the caller. Must be set before the run starts.
    pub fn with_unattended(mut self, unattended: bool) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("gate not yet shared");
        inner.unattended = unattended;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("gate not yet shared");
        inner.timeout = Some(timeout);
        self
    }

    pub fn unattended(&self) -> bool {
        self.inner.unattended
    }

    pub fn blanket_mode(&self) -> bool {
        self.inner.state.lock().expect("gate lock").blanket
    }

    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock().expect("gate lock");
        state
            .pending
            .values()
            .filter(|entry| entry.decision.is_none())
            .count()
    }

    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let state = self.inner.state.lock().expect("gate lock");
        state
            .pending
            .values()
            .filter(|entry| entry.decision.is_none())
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Blocks the issuing step until a decision arrives, the configured
    /// timeout elapses (a flagged rejection), or an auto-approve policy
    /// short-circuits the round-trip.
    pub fn request(
        &self,
        step_id: &StepId,
        kind: ApprovalKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> Result<ApprovalOutcome, GateError> {
        let subject = subject.into();
        let detail = detail.into();
        let (request, auto) = {
            let mut state = self.inner.state.lock().expect("gate lock");
            let request_id = state.next_request_id;
            state.next_request_id += 1;
            let request = ApprovalRequest {
                request_id,
                step_id: step_id.clone(),
                kind,
                subject,
                detail,
            };
            let auto = self.inner.unattended || state.blanket;
            if !auto {
                state.pending.insert(
                    request_id,
                    PendingEntry {
                        request: request.clone(),
                        decision: None,
                        auto: false,
                    },
                );
            }
            (request, auto)
        };

        self.emit_requested(&request)?;
        if auto {
            let outcome = ApprovalOutcome {
                request_id: request.request_id,
                decision: Decision::Approved,
                auto: true,
                timed_out: false,
            };
            self.emit_resolved(&request.step_id, outcome)?;
            return Ok(outcome);
        }

        let deadline = self.inner.timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.inner.state.lock().expect("gate lock");
        let outcome = loop {
            let decided = state
                .pending
                .get(&request.request_id)
                .and_then(|entry| entry.decision.map(|decision| (decision, entry.auto)));
            if let Some((decision, auto)) = decided {
                state.pending.remove(&request.request_id);
                break ApprovalOutcome {
                    request_id: request.request_id,
                    decision,
                    auto,
                    timed_out: false,
                };
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.pending.remove(&request.request_id);
                        break ApprovalOutcome {
                            request_id: request.request_id,
                            decision: Decision::Rejected,
                            auto: false,
                            timed_out: true,
                        };
                    }
                    let (next, _) = self
                        .inner
                        .decided
                        .wait_timeout(state, deadline - now)
                        .expect("gate lock");
                    state = next;
                }
                None => {
                    state = self.inner.decided.wait(state).expect("gate lock");
                }
            }
        };
        drop(state);

        self.emit_resolved(&request.step_id, outcome)?;
        Ok(outcome)
    }

    /// Records an operator decision for a pending request. Unrecognized
    /// input returns `Ok(None)` and leaves the request pending so the
    /// surface can re-prompt.
    pub fn submit_decision(
        &self,
        request_id: u64,
        decision_text: &str,
    ) -> Result<Option<Decision>, GateError> {
        let Some(decision) = parse_decision_text(decision_text) else {
            let state = self.inner.state.lock().expect("gate lock");
            if !state.pending.contains_key(&request_id) {
                return Err(GateError::UnknownRequest { request_id });
            }
            return Ok(None);
        };

        let mut state = self.inner.state.lock().expect("gate lock");
        let entry = state
            .pending
            .get_mut(&request_id)
            .filter(|entry| entry.decision.is_none())
            .ok_or(GateError::UnknownRequest { request_id })?;
        entry.decision = Some(decision);
        if decision == Decision::ApprovedAll {
            state.blanket = true;
            // Blanket mode covers requests already suspended, not just
            // future ones.
            for entry in state.pending.values_mut() {
                if entry.decision.is_none() {
                    entry.decision = Some(Decision::Approved);
                    entry.auto = true;
                }
            }
        }
        self.inner.decided.notify_all();
        Ok(Some(decision))
    }

    /// Operator abort path: every outstanding request resolves Rejected.
    pub fn reject_outstanding(&self) {
        let mut state = self.inner.state.lock().expect("gate lock");
        for entry in state.pending.values_mut() {
            if entry.decision.is_none() {
                entry.decision = Some(Decision::Rejected);
            }
        }
        self.inner.decided.notify_all();
    }

    fn emit_requested(&self, request: &ApprovalRequest) -> Result<(), GateError> {
        self.inner.events.publish(
            Some(&request.step_id),
            EventPayload::ApprovalRequested {
                request_id: request.request_id,
                approval_kind: request.kind.to_string(),
                subject: request.subject.clone(),
            },
        );
        self.audit(&json!({
            "at": now_secs(),
            "kind": "approval_requested",
            "requestId": request.request_id,
            "stepId": request.step_id.to_string(),
            "approvalKind": request.kind.to_string(),
            "subject": request.subject,
        }))
    }

    fn emit_resolved(&self, step_id: &StepId, outcome: ApprovalOutcome) -> Result<(), GateError> {
        self.inner.events.publish(
            Some(step_id),
            EventPayload::ApprovalResolved {
                request_id: outcome.request_id,
                decision: outcome.decision.to_string(),
                auto: outcome.auto,
                timed_out: outcome.timed_out,
            },
        );
        self.audit(&json!({
            "at": now_secs(),
            "kind": "approval_resolved",
            "requestId": outcome.request_id,
            "stepId": step_id.to_string(),
            "decision": outcome.decision.to_string(),
            "auto": outcome.auto,
            "timedOut": outcome.timed_out,
        }))
    }

    fn audit(&self, record: &serde_json::Value) -> Result<(), GateError> {
        append_audit_record(&self.inner.state_root, self.inner.run_id.as_str(), record).map_err(
            |source| GateError::Audit {
                path: audit_log_path(&self.inner.state_root, self.inner.run_id.as_str())
                    .display()
                    .to_string(),
                source,
            },
        )
    }
}
