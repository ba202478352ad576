use super::{io_error, CapabilityError};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Directories never descended into during search and glob.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".next",
    "dist",
    "build",
];

/// Extensions the search capability scans; everything else is skipped.
pub const SEARCHABLE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "sql"];

const DEFAULT_READ_LIMIT: usize = 2000;
const MAX_SEARCH_RESULTS: usize = 200;

pub fn read_file(workspace: &Path, args: &Map<String, Value>) -> Result<Value, CapabilityError> {
    let file_path = str_arg(args, "file_path").ok_or(CapabilityError::MissingArgument {
        capability: "read",
        arg: "file_path",
    })?;
    let path = resolve(workspace, file_path);
    if !path.is_file() {
        return Err(CapabilityError::InvalidArgument {
            capability: "read",
            arg: "file_path",
            reason: format!("file does not exist: {}", path.display()),
        });
    }

    let content = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
    let lines: Vec<&str> = content.lines().collect();
    let offset = args
        .get("offset")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .min(lines.len() as u64) as usize;
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|limit| limit as usize)
        .unwrap_or(DEFAULT_READ_LIMIT);
    let end = (offset + limit).min(lines.len());

    let mut numbered = String::new();
    for (index, line) in lines[offset..end].iter().enumerate() {
        numbered.push_str(&format!("{:>6}\t{}\n", offset + index + 1, line));
    }
    Ok(json!({
        "file": path.display().to_string(),
        "totalLines": lines.len(),
        "offset": offset,
        "linesReturned": end - offset,
        "content": numbered,
    }))
}

pub fn glob_files(workspace: &Path, args: &Map<String, Value>) -> Result<Value, CapabilityError> {
    let pattern = str_arg(args, "pattern").ok_or(CapabilityError::MissingArgument {
        capability: "glob",
        arg: "pattern",
    })?;
    let search_path = args
        .get("path")
        .and_then(Value::as_str)
        .map(|path| resolve(workspace, path))
        .unwrap_or_else(|| workspace.to_path_buf());

    let full_pattern = search_path.join(pattern).display().to_string();
    let walker = glob::glob(&full_pattern).map_err(|err| CapabilityError::InvalidArgument {
        capability: "glob",
        arg: "pattern",
        reason: err.to_string(),
    })?;

    let mut matches: Vec<(PathBuf, u64)> = Vec::new();
    for entry in walker {
        let Ok(path) = entry else { continue };
        if !path.is_file() || in_excluded_dir(&path) {
            continue;
        }
        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        matches.push((path, modified));
    }
    // Newest first, path as the tiebreaker for deterministic output.
    matches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let files: Vec<String> = matches
        .iter()
        .map(|(path, _)| path.display().to_string())
        .collect();
    Ok(json!({
        "pattern": pattern,
        "searchPath": search_path.display().to_string(),
        "count": files.len(),
        "files": files,
    }))
}

pub fn search(workspace: &Path, args: &Map<String, Value>) -> Result<Value, CapabilityError> {
    let pattern = str_arg(args, "pattern").ok_or(CapabilityError::MissingArgument {
        capability: "search",
        arg: "pattern",
    })?;
    let search_path = args
        .get("path")
        .and_then(Value::as_str)
        .map(|path| resolve(workspace, path))
        .unwrap_or_else(|| workspace.to_path_buf());
    let output_mode = args
        .get("output_mode")
        .and_then(Value::as_str)
        .unwrap_or("files");
    if !matches!(output_mode, "files" | "content" | "count") {
        return Err(CapabilityError::InvalidArgument {
            capability: "search",
            arg: "output_mode",
            reason: format!("expected files, content, or count; got `{output_mode}`"),
        });
    }
    let case_insensitive = args
        .get("case_insensitive")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let matcher = regex::RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| CapabilityError::InvalidArgument {
            capability: "search",
            arg: "pattern",
            reason: err.to_string(),
        })?;
    let file_filter = match args.get("file_pattern").and_then(Value::as_str) {
        Some(file_pattern) => Some(glob::Pattern::new(file_pattern).map_err(|err| {
            CapabilityError::InvalidArgument {
                capability: "search",
                arg: "file_pattern",
                reason: err.to_string(),
            }
        })?),
        None => None,
    };

    let mut candidates = Vec::new();
    collect_searchable(&search_path, &file_filter, &mut candidates)?;
    candidates.sort();

    let mut files_with_matches: Vec<String> = Vec::new();
    let mut content_lines: Vec<Value> = Vec::new();
    let mut total_matches = 0usize;
    for path in &candidates {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        let mut matched = false;
        for (index, line) in content.lines().enumerate() {
            if !matcher.is_match(line) {
                continue;
            }
            matched = true;
            total_matches += 1;
            if output_mode == "content" && content_lines.len() < MAX_SEARCH_RESULTS {
                content_lines.push(json!({
                    "file": path.display().to_string(),
                    "line": index + 1,
                    "text": line,
                }));
            }
            if output_mode == "files" {
                break;
            }
        }
        if matched {
            files_with_matches.push(path.display().to_string());
        }
    }

    let result = match output_mode {
        "content" => json!({
            "pattern": pattern,
            "matchCount": total_matches,
            "matches": content_lines,
        }),
        "count" => json!({
            "pattern": pattern,
            "fileCount": files_with_matches.len(),
            "matchCount": total_matches,
        }),
        _ => json!({
            "pattern": pattern,
            "fileCount": files_with_matches.len(),
            "files": files_with_matches,
        }),
    };
    Ok(result)
}

fn collect_searchable(
    root: &Path,
    file_filter: &Option<glob::Pattern>,
    out: &mut Vec<PathBuf>,
) -> Result<(), CapabilityError> {
    if !root.is_dir() {
        return Err(CapabilityError::InvalidArgument {
            capability: "search",
            arg: "path",
            reason: format!("directory does not exist: {}", root.display()),
        });
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|err| io_error(&dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !EXCLUDED_DIRS.contains(&name.as_ref()) {
                    stack.push(path);
                }
                continue;
            }
            let searchable = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SEARCHABLE_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !searchable {
                continue;
            }
            if let Some(filter) = file_filter {
                let name = entry.file_name();
                if !filter.matches(&name.to_string_lossy()) {
                    continue;
                }
            }
            out.push(path);
        }
    }
    Ok(())
}

fn in_excluded_dir(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .map(|name| EXCLUDED_DIRS.contains(&name))
            .unwrap_or(false)
    })
}

fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}
