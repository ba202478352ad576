use super::cli::RunOptions;
use crate::approval::ApprovalGate;
use crate::capability::{OperatorPrompt, ToolRegistry};
use crate::config::{ConfigError, PipelineConfig};
use crate::engine::{CommandEngine, ReasoningEngine};
use crate::events::{Event, EventPayload, EventStream};
use crate::pipeline::{Orchestrator, PipelineError, RunSummary};
use crate::shared::fs_atomic::canonicalize_existing;
use crate::shared::ids::RunId;
use crate::shared::logging::{append_run_log_line, now_secs};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const STATE_DIR_NAME: &str = ".chbuild";
pub const CONFIG_FILE_NAME: &str = "chbuild.yaml";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid run id `{run_id}`: {reason}")]
    InvalidRunId { run_id: String, reason: String },
    #[error("config must set engine.program; no reasoning engine is configured")]
    MissingEngine,
    #[error("pipeline worker panicked")]
    WorkerPanicked,
}

/// Operator input over stdin, shared by ask_human and approval prompts.
struct StdinOperator;

impl OperatorPrompt for StdinOperator {
    fn ask(&self, prompt: &str) -> Result<String, String> {
        println!("\n{prompt}");
        print!("> ");
        std::io::stdout().flush().map_err(|err| err.to_string())?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|err| err.to_string())?;
        Ok(line.trim_end_matches(['\n', '\r']).to_string())
    }
}

/// Runs the pipeline on a worker thread while this thread renders events
/// and feeds approval decisions from stdin.
pub fn run_interactive(options: &RunOptions) -> Result<String, SessionError> {
    let workspace = canonicalize_existing(&options.path).map_err(|source| SessionError::Io {
        path: options.path.display().to_string(),
        source,
    })?;
    let state_root = workspace.join(STATE_DIR_NAME);
    let config_path = options
        .config
        .clone()
        .unwrap_or_else(|| workspace.join(CONFIG_FILE_NAME));
    let config = if config_path.exists() {
        PipelineConfig::from_path(&config_path)?
    } else {
        PipelineConfig::default()
    };
    let unattended = options.unattended || config.unattended;

    let run_id = match &options.run_id {
        Some(raw) => RunId::parse(raw).map_err(|reason| SessionError::InvalidRunId {
            run_id: raw.clone(),
            reason,
        })?,
        None => RunId::parse(&format!("run-{}", now_secs())).expect("generated run id"),
    };

    let engine_config = config.engine.clone().ok_or(SessionError::MissingEngine)?;
    let engine: Arc<dyn ReasoningEngine> =
        Arc::new(CommandEngine::new(&engine_config.program).with_args(engine_config.args.clone()));

    let events = EventStream::new();
    let mut cursor = events.subscribe_with_replay();

    let mut gate = ApprovalGate::new(events.clone(), &state_root, run_id.clone())
        .with_unattended(unattended);
    if let Some(secs) = config.approval_timeout_secs {
        gate = gate.with_timeout(Duration::from_secs(secs));
    }

    let mut registry = ToolRegistry::new(
        &workspace,
        gate.clone(),
        events.clone(),
        Arc::new(StdinOperator),
    );
    if let Some(secs) = config.command_timeout_secs {
        registry = registry.with_command_timeout(Duration::from_secs(secs));
    }

    let steps = config.pipeline_steps()?;
    let orchestrator = Arc::new(Orchestrator::new(
        run_id.clone(),
        &workspace,
        &state_root,
        steps,
        engine,
        events.clone(),
        gate.clone(),
        registry,
    ));

    println!("run {run_id} starting in {}", workspace.display());
    let worker = {
        let orchestrator = Arc::clone(&orchestrator);
        thread::spawn(move || orchestrator.run())
    };

    loop {
        for event in cursor.poll() {
            render_event(&gate, &state_root, &run_id, &event);
        }
        if worker.is_finished() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    for event in cursor.poll() {
        render_event(&gate, &state_root, &run_id, &event);
    }

    let summary = worker.join().map_err(|_| SessionError::WorkerPanicked)??;
    Ok(summary_text(&run_id, &summary))
}

fn summary_text(run_id: &RunId, summary: &RunSummary) -> String {
    let mut lines = vec![format!("run {run_id} finished: {}", summary.run_state)];
    for (step_id, state) in &summary.steps {
        lines.push(format!("  {step_id}: {state}"));
    }
    lines.join("\n")
}

fn render_event(gate: &ApprovalGate, state_root: &Path, run_id: &RunId, event: &Event) {
    let step = event.step_id.as_deref().unwrap_or("-");
    let line = match &event.payload {
        EventPayload::StepStatusChanged { from, to } => {
            println!("[{step}] {from} -> {to}");
            format!("step {step}: {from} -> {to}")
        }
        EventPayload::Message { text } => {
            println!("[{step}] {text}");
            format!("step {step}: {text}")
        }
        EventPayload::Error { message } => {
            eprintln!("[{step}] error: {message}");
            format!("step {step} error: {message}")
        }
        EventPayload::ApprovalRequested {
            request_id,
            approval_kind,
            subject,
        } => {
            prompt_for_decision(gate, *request_id);
            format!("approval requested ({approval_kind}) for {subject}")
        }
        EventPayload::ApprovalResolved {
            request_id,
            decision,
            auto,
            timed_out,
        } => {
            let qualifier = if *timed_out {
                " (timed out)"
            } else if *auto {
                " (auto)"
            } else {
                ""
            };
            println!("[{step}] approval {request_id}: {decision}{qualifier}");
            format!("approval {request_id}: {decision}{qualifier}")
        }
    };
    let _ = append_run_log_line(state_root, run_id.as_str(), &line);
}

/// Shows the pending request's detail (diff or command) and reads decisions
/// until one parses. A request that resolved meanwhile (timeout, abort) is
/// silently dropped.
fn prompt_for_decision(gate: &ApprovalGate, request_id: u64) {
    let Some(request) = gate
        .pending_requests()
        .into_iter()
        .find(|request| request.request_id == request_id)
    else {
        return;
    };

    println!("\n--- approval required: {} ---", request.kind);
    println!("{}", request.detail.trim_end());
    loop {
        print!("approve? [y/n/all]: ");
        if std::io::stdout().flush().is_err() {
            return;
        }
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return;
        }
        match gate.submit_decision(request_id, &line) {
            Ok(Some(_)) => return,
            Ok(None) => {
                println!("unrecognized answer; expected one of y/yes/ok/apply, n/no/skip, all");
            }
            Err(_) => return,
        }
    }
}
