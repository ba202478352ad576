use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine returned a malformed action: {reason}")]
    MalformedAction { reason: String },
    #[error("engine failure: {message}")]
    External { message: String },
    #[error("engine process failed: {source}")]
    Process {
        #[source]
        source: std::io::Error,
    },
}

/// One prior tool round-trip, replayed to the engine so it can reason over
/// what its earlier calls returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineExchange {
    pub capability: String,
    pub args: Map<String, Value>,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub step_id: String,
    pub instruction: String,
    #[serde(default)]
    pub history: Vec<EngineExchange>,
}

/// The action envelope an engine must answer with. Exactly one of:
///   {"action": "tool_call", "capability": "...", "args": {...}}
///   {"action": "final_answer", "text": "..."}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum EngineAction {
    ToolCall {
        capability: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    FinalAnswer {
        text: String,
    },
}

/// Strict envelope parsing: the whole payload must be one well-formed
/// action object. Anything else is a malformed-action error, never a
/// silent fallback.
pub fn parse_engine_action(payload: &str) -> Result<EngineAction, EngineError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(EngineError::MalformedAction {
            reason: "empty engine response".to_string(),
        });
    }
    serde_json::from_str(trimmed).map_err(|err| EngineError::MalformedAction {
        reason: err.to_string(),
    })
}

/// Produces the next action for a step. Implementations are external
/// collaborators; any failure is surfaced as an engine error and handled
/// by run policy, never retried blindly here.
pub trait ReasoningEngine: Send + Sync {
    fn propose_next_action(&self, request: &EngineRequest) -> Result<EngineAction, EngineError>;
}

/// Engine adapter that shells out to a configured program. The request is
/// serialized to the child's stdin; the child must print one action
/// envelope to stdout and exit zero.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_ENGINE_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ReasoningEngine for CommandEngine {
    fn propose_next_action(&self, request: &EngineRequest) -> Result<EngineAction, EngineError> {
        let payload = serde_json::to_string(request).map_err(|err| EngineError::External {
            message: format!("request serialization failed: {err}"),
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Process { source })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .map_err(|source| EngineError::Process { source })?;
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || read_pipe(stdout_pipe));
        let stderr_handle = std::thread::spawn(move || read_pipe(stderr_pipe));

        let deadline = std::time::Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(|source| EngineError::Process { source })? {
                Some(status) => break Some(status),
                None if std::time::Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let Some(status) = status else {
            return Err(EngineError::External {
                message: format!("engine timed out after {}s", self.timeout.as_secs()),
            });
        };
        if !status.success() {
            return Err(EngineError::External {
                message: format!(
                    "engine exited with status {}: {}",
                    status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }
        parse_engine_action(&stdout)
    }
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = String::new();
    let _ = pipe.read_to_string(&mut buffer);
    buffer
}
