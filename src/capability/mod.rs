pub mod command;
pub mod fs_ops;

use crate::approval::{ApprovalGate, ApprovalKind};
use crate::diff::{DiffError, FileDiff};
use crate::events::{EventPayload, EventStream};
use crate::pipeline::StepBoard;
use crate::pipeline::StepState;
use crate::shared::ids::StepId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    None,
    Write,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer,
    Boolean,
}

impl ArgKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Integer => value.is_u64() || value.is_i64(),
            ArgKind::Boolean => value.is_boolean(),
        }
    }
}

impl std::fmt::Display for ArgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgKind::String => write!(f, "string"),
            ArgKind::Integer => write!(f, "integer"),
            ArgKind::Boolean => write!(f, "boolean"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub side_effect: SideEffect,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
}

/// The closed capability set. Registration is static at process start; no
/// dynamic loading.
pub const CAPABILITIES: &[CapabilitySpec] = &[
    CapabilitySpec {
        name: "search",
        side_effect: SideEffect::None,
        description: "Search file contents for a regex pattern",
        args: &[
            ArgSpec {
                name: "pattern",
                kind: ArgKind::String,
                required: true,
            },
            ArgSpec {
                name: "path",
                kind: ArgKind::String,
                required: false,
            },
            ArgSpec {
                name: "file_pattern",
                kind: ArgKind::String,
                required: false,
            },
            ArgSpec {
                name: "output_mode",
                kind: ArgKind::String,
                required: false,
            },
            ArgSpec {
                name: "case_insensitive",
                kind: ArgKind::Boolean,
                required: false,
            },
        ],
    },
    CapabilitySpec {
        name: "glob",
        side_effect: SideEffect::None,
        description: "Find files matching a glob pattern",
        args: &[
            ArgSpec {
                name: "pattern",
                kind: ArgKind::String,
                required: true,
            },
            ArgSpec {
                name: "path",
                kind: ArgKind::String,
                required: false,
            },
        ],
    },
    CapabilitySpec {
        name: "read",
        side_effect: SideEffect::None,
        description: "Read a file with optional line range",
        args: &[
            ArgSpec {
                name: "file_path",
                kind: ArgKind::String,
                required: true,
            },
            ArgSpec {
                name: "offset",
                kind: ArgKind::Integer,
                required: false,
            },
            ArgSpec {
                name: "limit",
                kind: ArgKind::Integer,
                required: false,
            },
        ],
    },
    CapabilitySpec {
        name: "write",
        side_effect: SideEffect::Write,
        description: "Write file content after operator approval of a diff",
        args: &[
            ArgSpec {
                name: "file_path",
                kind: ArgKind::String,
                required: true,
            },
            ArgSpec {
                name: "content",
                kind: ArgKind::String,
                required: true,
            },
        ],
    },
    CapabilitySpec {
        name: "run_command",
        side_effect: SideEffect::Exec,
        description: "Execute an allowlisted shell command after approval",
        args: &[
            ArgSpec {
                name: "command",
                kind: ArgKind::String,
                required: true,
            },
            ArgSpec {
                name: "working_dir",
                kind: ArgKind::String,
                required: false,
            },
        ],
    },
    CapabilitySpec {
        name: "ask_human",
        side_effect: SideEffect::None,
        description: "Request free-form input from the operator",
        args: &[ArgSpec {
            name: "prompt",
            kind: ArgKind::String,
            required: true,
        }],
    },
];

pub fn capability_spec(name: &str) -> Option<&'static CapabilitySpec> {
    CAPABILITIES.iter().find(|spec| spec.name == name)
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown capability `{capability}`")]
    CapabilityNotFound { capability: String },
    #[error("capability `{capability}` is not permitted for step `{step_id}`")]
    NotPermitted { capability: String, step_id: String },
    #[error("missing required argument `{arg}` for `{capability}`")]
    MissingArgument {
        capability: &'static str,
        arg: &'static str,
    },
    #[error("unknown argument `{arg}` for `{capability}`")]
    UnknownArgument { capability: &'static str, arg: String },
    #[error("invalid argument type for `{capability}.{arg}`; expected {expected}")]
    InvalidArgumentType {
        capability: &'static str,
        arg: &'static str,
        expected: ArgKind,
    },
    #[error("invalid argument for `{capability}.{arg}`: {reason}")]
    InvalidArgument {
        capability: &'static str,
        arg: &'static str,
        reason: String,
    },
    #[error("approval denied for `{subject}` (timed_out: {timed_out})")]
    ApprovalDenied { subject: String, timed_out: bool },
    #[error("diff failure: {0}")]
    Diff(#[from] DiffError),
    #[error("approval gate failure: {0}")]
    Gate(#[from] crate::approval::GateError),
    #[error("operator input unavailable: {0}")]
    Operator(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CapabilityError {
    /// CapabilityNotFound is a programming error and aborts the run; the
    /// rest are reported to the issuing step for a local policy decision.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CapabilityError::CapabilityNotFound { .. })
    }
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> CapabilityError {
    CapabilityError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One tool call issued by a step. Immutable once created; the sequence id
/// orders calls within a run and detects idempotent replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub sequence_id: u64,
    pub step_id: StepId,
    pub capability: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Issuing step's identity and permissions, plus the board used to surface
/// the waiting-for-approval state while the gate suspends the call.
pub struct InvocationScope<'a> {
    pub step_id: &'a StepId,
    pub allowed: Option<&'a BTreeSet<String>>,
    pub board: Option<&'a StepBoard>,
}

pub trait OperatorPrompt: Send + Sync {
    fn ask(&self, prompt: &str) -> Result<String, String>;
}

/// Dispatches validated tool calls. `write`/`exec` capabilities route
/// through the approval gate before touching the workspace; `none`-class
/// capabilities execute immediately.
pub struct ToolRegistry {
    workspace_root: PathBuf,
    gate: ApprovalGate,
    events: EventStream,
    operator: Arc<dyn OperatorPrompt>,
    command_timeout: Duration,
    applied: Mutex<BTreeMap<u64, Value>>,
}

impl ToolRegistry {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        gate: ApprovalGate,
        events: EventStream,
        operator: Arc<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            gate,
            events,
            operator,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            applied: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn invoke(
        &self,
        scope: &InvocationScope<'_>,
        invocation: &ToolInvocation,
    ) -> Result<Value, CapabilityError> {
        let spec = capability_spec(&invocation.capability).ok_or_else(|| {
            CapabilityError::CapabilityNotFound {
                capability: invocation.capability.clone(),
            }
        })?;
        if let Some(allowed) = scope.allowed {
            if !allowed.contains(spec.name) {
                return Err(CapabilityError::NotPermitted {
                    capability: spec.name.to_string(),
                    step_id: scope.step_id.to_string(),
                });
            }
        }
        validate_args(spec, &invocation.args)?;

        if spec.side_effect != SideEffect::None {
            let applied = self.applied.lock().expect("registry lock");
            if let Some(result) = applied.get(&invocation.sequence_id) {
                // Replayed sequence id: the effect already happened once.
                return Ok(result.clone());
            }
        }

        let result = match spec.name {
            "search" => fs_ops::search(&self.workspace_root, &invocation.args)?,
            "glob" => fs_ops::glob_files(&self.workspace_root, &invocation.args)?,
            "read" => fs_ops::read_file(&self.workspace_root, &invocation.args)?,
            "write" => self.write_file(scope, invocation)?,
            "run_command" => self.run_command(scope, invocation)?,
            "ask_human" => self.ask_human(scope, invocation)?,
            other => {
                return Err(CapabilityError::CapabilityNotFound {
                    capability: other.to_string(),
                })
            }
        };

        if spec.side_effect != SideEffect::None {
            self.applied
                .lock()
                .expect("registry lock")
                .insert(invocation.sequence_id, result.clone());
        }
        Ok(result)
    }

    fn write_file(
        &self,
        scope: &InvocationScope<'_>,
        invocation: &ToolInvocation,
    ) -> Result<Value, CapabilityError> {
        let file_path = required_str(invocation, "file_path")?;
        let content = required_str(invocation, "content")?;
        let path = self.resolve(file_path);

        let (original, exists) = match fs::read_to_string(&path) {
            Ok(current) => (current, true),
            Err(err) if err.kind() == ErrorKind::NotFound => (String::new(), false),
            Err(err) => return Err(io_error(&path, err)),
        };

        if exists && original == content {
            return Ok(json!({
                "file": path.display().to_string(),
                "success": true,
                "unchanged": true,
                "message": "no changes needed - skipped",
            }));
        }

        let display_name = path
            .strip_prefix(&self.workspace_root)
            .unwrap_or(&path)
            .display()
            .to_string();
        let diff = FileDiff::compute(&display_name, &original, content);
        let outcome = self.gated(scope, ApprovalKind::FileWrite, &display_name, diff.render())?;
        if !outcome.approved() {
            return Err(CapabilityError::ApprovalDenied {
                subject: display_name,
                timed_out: outcome.timed_out,
            });
        }

        diff.apply(&path)?;
        Ok(json!({
            "file": path.display().to_string(),
            "bytesWritten": content.len(),
            "success": true,
            "operation": if exists { "update" } else { "create" },
        }))
    }

    fn run_command(
        &self,
        scope: &InvocationScope<'_>,
        invocation: &ToolInvocation,
    ) -> Result<Value, CapabilityError> {
        let command_line = required_str(invocation, "command")?;
        let working_dir = optional_str(invocation, "working_dir")?;
        let cwd = working_dir
            .map(|dir| self.resolve(dir))
            .unwrap_or_else(|| self.workspace_root.clone());
        if !cwd.is_dir() {
            return Err(CapabilityError::InvalidArgument {
                capability: "run_command",
                arg: "working_dir",
                reason: format!("directory does not exist: {}", cwd.display()),
            });
        }

        // Blocked commands never reach the gate; the step sees a structured
        // refusal and can retry with a different command.
        if let Some(reason) = command::screen_command(command_line) {
            return Ok(json!({
                "command": command_line,
                "workingDir": cwd.display().to_string(),
                "exitCode": 1,
                "stdout": "",
                "stderr": "",
                "blocked": true,
                "error": reason.to_string(),
            }));
        }

        let detail = format!(
            "command: {command_line}\nworking directory: {}",
            cwd.display()
        );
        let outcome = self.gated(scope, ApprovalKind::CommandExecution, command_line, detail)?;
        if !outcome.approved() {
            return Err(CapabilityError::ApprovalDenied {
                subject: command_line.to_string(),
                timed_out: outcome.timed_out,
            });
        }

        let output = command::execute_command(command_line, &cwd, self.command_timeout)
            .map_err(|err| io_error(&cwd, err))?;
        if output.timed_out {
            return Ok(json!({
                "command": command_line,
                "workingDir": cwd.display().to_string(),
                "exitCode": -1,
                "stdout": output.stdout,
                "stderr": output.stderr,
                "timedOut": true,
                "error": format!(
                    "command timed out after {}s",
                    self.command_timeout.as_secs()
                ),
            }));
        }
        Ok(json!({
            "command": command_line,
            "workingDir": cwd.display().to_string(),
            "exitCode": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }

    fn ask_human(
        &self,
        scope: &InvocationScope<'_>,
        invocation: &ToolInvocation,
    ) -> Result<Value, CapabilityError> {
        let prompt = required_str(invocation, "prompt")?;
        if self.gate.unattended() {
            // Unattended runs never block on a human; answer with the
            // documented empty default and leave a trace on the stream.
            self.events.publish(
                Some(scope.step_id),
                EventPayload::Message {
                    text: format!("ask_human auto-answered empty (unattended): {prompt}"),
                },
            );
            return Ok(json!({ "response": "", "unattended": true }));
        }
        let response = self
            .operator
            .ask(prompt)
            .map_err(CapabilityError::Operator)?;
        Ok(json!({ "response": response }))
    }

    fn gated(
        &self,
        scope: &InvocationScope<'_>,
        kind: ApprovalKind,
        subject: &str,
        detail: String,
    ) -> Result<crate::approval::ApprovalOutcome, CapabilityError> {
        if let Some(board) = scope.board {
            board.set_state(scope.step_id, StepState::WaitingApproval);
        }
        let outcome = self.gate.request(scope.step_id, kind, subject, detail);
        if let Some(board) = scope.board {
            board.set_state(scope.step_id, StepState::Running);
        }
        Ok(outcome?)
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

fn validate_args(spec: &CapabilitySpec, args: &Map<String, Value>) -> Result<(), CapabilityError> {
    for key in args.keys() {
        if !spec.args.iter().any(|arg| arg.name == key) {
            return Err(CapabilityError::UnknownArgument {
                capability: spec.name,
                arg: key.clone(),
            });
        }
    }
    for arg in spec.args {
        match args.get(arg.name) {
            Some(value) => {
                if !arg.kind.accepts(value) {
                    return Err(CapabilityError::InvalidArgumentType {
                        capability: spec.name,
                        arg: arg.name,
                        expected: arg.kind,
                    });
                }
            }
            None if arg.required => {
                return Err(CapabilityError::MissingArgument {
                    capability: spec.name,
                    arg: arg.name,
                });
            }
            None => {}
        }
    }
    Ok(())
}

fn required_str<'a>(
    invocation: &'a ToolInvocation,
    name: &'static str,
) -> Result<&'a str, CapabilityError> {
    invocation
        .args
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_arg(&invocation.capability, name))
}

fn optional_str<'a>(
    invocation: &'a ToolInvocation,
    name: &'static str,
) -> Result<Option<&'a str>, CapabilityError> {
    Ok(invocation.args.get(name).and_then(Value::as_str))
}

fn missing_arg(capability: &str, arg: &'static str) -> CapabilityError {
    let capability = capability_spec(capability)
        .map(|spec| spec.name)
        .unwrap_or("unknown");
    CapabilityError::MissingArgument { capability, arg }
}
