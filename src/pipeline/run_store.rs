use super::StepState;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::RunId;
use crate::shared::logging::now_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("run record not found at {path}")]
    NotFound { path: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> RunStoreError {
    RunStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> RunStoreError {
    RunStoreError::Json {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: String,
    pub state: StepState,
}

/// Durable snapshot of a migration run, rewritten atomically at every
/// step transition so `status` works from another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: RunState,
    pub workspace_root: String,
    pub steps: Vec<StepRecord>,
}

impl RunRecord {
    pub fn new(run_id: &RunId, workspace_root: impl Into<String>, step_ids: &[String]) -> Self {
        let at = now_secs();
        Self {
            run_id: run_id.to_string(),
            created_at: at,
            updated_at: at,
            state: RunState::Running,
            workspace_root: workspace_root.into(),
            steps: step_ids
                .iter()
                .map(|id| StepRecord {
                    id: id.clone(),
                    state: StepState::Pending,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    state_root: PathBuf,
}

impl RunStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.state_root.join("runs").join(run_id).join("run.json")
    }

    pub fn save(&self, record: &RunRecord) -> Result<(), RunStoreError> {
        let path = self.record_path(&record.run_id);
        let payload = serde_json::to_vec_pretty(record).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &payload).map_err(|err| io_error(&path, err))
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord, RunStoreError> {
        let path = self.record_path(run_id);
        if !path.exists() {
            return Err(RunStoreError::NotFound {
                path: path.display().to_string(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        serde_json::from_str(&raw).map_err(|err| json_error(&path, err))
    }

    /// Most recently updated run under the state root, for the status verb
    /// when no run id is given.
    pub fn latest_run_id(&self) -> Result<Option<String>, RunStoreError> {
        let runs_dir = self.state_root.join("runs");
        if !runs_dir.is_dir() {
            return Ok(None);
        }
        let mut latest: Option<(i64, String)> = None;
        let entries = fs::read_dir(&runs_dir).map_err(|err| io_error(&runs_dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&runs_dir, err))?;
            let run_id = entry.file_name().to_string_lossy().to_string();
            let Ok(record) = self.load(&run_id) else {
                continue;
            };
            if latest
                .as_ref()
                .map(|(at, _)| record.updated_at > *at)
                .unwrap_or(true)
            {
                latest = Some((record.updated_at, run_id));
            }
        }
        Ok(latest.map(|(_, run_id)| run_id))
    }
}
