use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn run_log_path(state_root: &Path, run_id: &str) -> PathBuf {
    state_root.join("runs").join(run_id).join("pipeline.log")
}

pub fn audit_log_path(state_root: &Path, run_id: &str) -> PathBuf {
    state_root.join("runs").join(run_id).join("audit.jsonl")
}

pub fn append_run_log_line(state_root: &Path, run_id: &str, line: &str) -> std::io::Result<()> {
    append_line(&run_log_path(state_root, run_id), line)
}

/// Appends one serialized record to the per-run audit log. Records are
/// append-only; nothing in the crate rewrites this file.
pub fn append_audit_record(
    state_root: &Path,
    run_id: &str,
    record: &serde_json::Value,
) -> std::io::Result<()> {
    let line = serde_json::to_string(record)
        .map_err(|err| std::io::Error::other(format!("audit record encode failed: {err}")))?;
    append_line(&audit_log_path(state_root, run_id), &line)
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
