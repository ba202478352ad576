use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Context lines kept on each side of a changed run when grouping hunks.
const HUNK_CONTEXT_LINES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("stale base for {path}: file content no longer matches the recorded original")]
    StaleBase { path: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineChange {
    Context,
    Removed,
    Added,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub change: LineChange,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub original_start: usize,
    pub original_len: usize,
    pub proposed_start: usize,
    pub proposed_len: usize,
    pub lines: Vec<DiffLine>,
}

/// Immutable line diff between a recorded base and a proposed replacement.
/// `apply` refuses to run when the target no longer hashes to the base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub file_name: String,
    pub base_digest: String,
    pub proposed: String,
    pub hunks: Vec<DiffHunk>,
}

pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl FileDiff {
    /// Deterministic and pure: identical inputs always produce an identical
    /// diff, hunk for hunk.
    pub fn compute(file_name: &str, original: &str, proposed: &str) -> Self {
        let original_lines: Vec<&str> = split_lines(original);
        let proposed_lines: Vec<&str> = split_lines(proposed);
        let ops = diff_ops(&original_lines, &proposed_lines);
        Self {
            file_name: file_name.to_string(),
            base_digest: content_digest(original),
            proposed: proposed.to_string(),
            hunks: group_hunks(&ops),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Conventional unified rendering suitable for direct display.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("--- a/{}\n", self.file_name));
        out.push_str(&format!("+++ b/{}\n", self.file_name));
        for hunk in &self.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.original_start, hunk.original_len, hunk.proposed_start, hunk.proposed_len
            ));
            for line in &hunk.lines {
                let marker = match line.change {
                    LineChange::Context => ' ',
                    LineChange::Removed => '-',
                    LineChange::Added => '+',
                };
                out.push(marker);
                out.push_str(&line.text);
                out.push('\n');
            }
        }
        out
    }

    /// Re-reads the target (a missing file counts as an empty base), verifies
    /// the stale-base digest, then replaces the content atomically.
    pub fn apply(&self, path: &Path) -> Result<(), DiffError> {
        let current = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(io_error(path, err)),
        };
        if content_digest(&current) != self.base_digest {
            return Err(DiffError::StaleBase {
                path: path.display().to_string(),
            });
        }
        atomic_write_file(path, self.proposed.as_bytes()).map_err(|err| io_error(path, err))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> DiffError {
    DiffError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn split_lines(content: &str) -> Vec<&str> {
    if content.is_empty() {
        Vec::new()
    } else {
        content.lines().collect()
    }
}

#[derive(Debug, Clone)]
struct DiffOp {
    change: LineChange,
    text: String,
}

/// Longest-common-subsequence walk producing an ordered op list. Quadratic
/// in line count, which is fine for the source files this pipeline touches.
fn diff_ops(original: &[&str], proposed: &[&str]) -> Vec<DiffOp> {
    let rows = original.len();
    let cols = proposed.len();
    let mut table = vec![0u32; (rows + 1) * (cols + 1)];
    let idx = |r: usize, c: usize| r * (cols + 1) + c;

    for r in (0..rows).rev() {
        for c in (0..cols).rev() {
            table[idx(r, c)] = if original[r] == proposed[c] {
                table[idx(r + 1, c + 1)] + 1
            } else {
                table[idx(r + 1, c)].max(table[idx(r, c + 1)])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut r, mut c) = (0usize, 0usize);
    while r < rows && c < cols {
        if original[r] == proposed[c] {
            ops.push(DiffOp {
                change: LineChange::Context,
                text: original[r].to_string(),
            });
            r += 1;
            c += 1;
        } else if table[idx(r + 1, c)] >= table[idx(r, c + 1)] {
            ops.push(DiffOp {
                change: LineChange::Removed,
                text: original[r].to_string(),
            });
            r += 1;
        } else {
            ops.push(DiffOp {
                change: LineChange::Added,
                text: proposed[c].to_string(),
            });
            c += 1;
        }
    }
    for line in &original[r..] {
        ops.push(DiffOp {
            change: LineChange::Removed,
            text: line.to_string(),
        });
    }
    for line in &proposed[c..] {
        ops.push(DiffOp {
            change: LineChange::Added,
            text: line.to_string(),
        });
    }
    ops
}

fn group_hunks(ops: &[DiffOp]) -> Vec<DiffHunk> {
    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.change != LineChange::Context)
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return Vec::new();
    }

    // Group changed runs whose context windows touch into one hunk.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &index in &changed {
        let start = index.saturating_sub(HUNK_CONTEXT_LINES);
        let end = (index + HUNK_CONTEXT_LINES + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => ranges.push((start, end)),
        }
    }

    // Line counters track positions in the original/proposed documents as
    // the op list is walked.
    let mut hunks = Vec::new();
    let mut original_line = 0usize;
    let mut proposed_line = 0usize;
    let mut cursor = 0usize;
    for (start, end) in ranges {
        for op in &ops[cursor..start] {
            match op.change {
                LineChange::Context => {
                    original_line += 1;
                    proposed_line += 1;
                }
                LineChange::Removed => original_line += 1,
                LineChange::Added => proposed_line += 1,
            }
        }

        let mut original_len = 0usize;
        let mut proposed_len = 0usize;
        let mut lines = Vec::with_capacity(end - start);
        for op in &ops[start..end] {
            match op.change {
                LineChange::Context => {
                    original_len += 1;
                    proposed_len += 1;
                }
                LineChange::Removed => original_len += 1,
                LineChange::Added => proposed_len += 1,
            }
            lines.push(DiffLine {
                change: op.change,
                text: op.text.clone(),
            });
        }

        hunks.push(DiffHunk {
            original_start: if original_len == 0 {
                original_line
            } else {
                original_line + 1
            },
            original_len,
            proposed_start: if proposed_len == 0 {
                proposed_line
            } else {
                proposed_line + 1
            },
            proposed_len,
            lines,
        });

        original_line += original_len;
        proposed_line += proposed_len;
        cursor = end;
    }
    hunks
}
