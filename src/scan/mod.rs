use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::RunId;
use crate::shared::logging::now_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ScanStoreError {
    #[error("scan artifact already recorded at {path}")]
    AlreadyRecorded { path: String },
    #[error("scan artifact not found at {path}")]
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

fn io_error(path: &Path, source: std::io::Error) -> ScanStoreError {
    ScanStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> ScanStoreError {
    ScanStoreError::Json {
        path: path.display().to_string(),
        source,
    }
}

/// One analytical query discovered in the workspace. Later steps consume
/// these read-only; the scan step is the only writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySite {
    pub file_path: String,
    pub line_start: usize,
    pub line_end: usize,
    pub query_kind: String,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanArtifact {
    pub run_id: String,
    pub created_at: i64,
    pub workspace_root: String,
    pub summary: String,
    pub sites: Vec<QuerySite>,
}

impl ScanArtifact {
    pub fn new(
        run_id: &RunId,
        workspace_root: impl Into<String>,
        summary: impl Into<String>,
        sites: Vec<QuerySite>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            created_at: now_secs(),
            workspace_root: workspace_root.into(),
            summary: summary.into(),
            sites,
        }
    }
}

/// Write-once persistence for the scan artifact under the per-run state
/// directory. A second record attempt for the same run is an error, never
/// an overwrite.
#[derive(Debug, Clone)]
pub struct ScanStore {
    state_root: PathBuf,
}

impl ScanStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn artifact_path(&self, run_id: &RunId) -> PathBuf {
        self.state_root
            .join("runs")
            .join(run_id.as_str())
            .join("scan.json")
    }

    pub fn record(&self, artifact: &ScanArtifact) -> Result<PathBuf, ScanStoreError> {
        let run_id = RunId::parse(&artifact.run_id).map_err(|reason| ScanStoreError::Io {
            path: artifact.run_id.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, reason),
        })?;
        let path = self.artifact_path(&run_id);
        if path.exists() {
            return Err(ScanStoreError::AlreadyRecorded {
                path: path.display().to_string(),
            });
        }
        let payload =
            serde_json::to_vec_pretty(artifact).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &payload).map_err(|err| io_error(&path, err))?;
        Ok(path)
    }

    pub fn load(&self, run_id: &RunId) -> Result<ScanArtifact, ScanStoreError> {
        let path = self.artifact_path(run_id);
        if !path.exists() {
            return Err(ScanStoreError::NotFound {
                path: path.display().to_string(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        serde_json::from_str(&raw).map_err(|err| json_error(&path, err))
    }

    pub fn exists(&self, run_id: &RunId) -> bool {
        self.artifact_path(run_id).exists()
    }
}

/// Parses an engine final answer that carries discovered sites as a JSON
/// array. Non-conforming answers yield an empty site list; the answer text
/// is still preserved as the artifact summary.
pub fn sites_from_answer(answer: &str) -> Vec<QuerySite> {
    serde_json::from_str(answer.trim()).unwrap_or_default()
}
