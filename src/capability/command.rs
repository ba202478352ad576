use regex::Regex;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// Executables a step may run; anything else is refused before the gate.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "npm", "yarn", "bun", "pnpm", "node", "ls", "cat", "grep", "find", "mkdir", "touch", "echo",
    "pwd", "which", "whoami", "test", "tsc", "npx",
];

const DANGEROUS_PATTERN_SOURCES: &[&str] = &[
    r"\brm\s+-[rf]",
    r"\brm\s+--",
    r"\bsudo\b",
    r"\bchmod\b",
    r"\bchown\b",
    r"\bmkfs\b",
    r"\bdd\s+if=",
    r">\s*/dev/",
    r"\bcurl\b.*\|\s*(ba)?sh",
    r"\bwget\b.*\|\s*(ba)?sh",
    r"\beval\b",
    r"\bkill\s+-9",
    r":\(\)\s*\{",
    r"\bshutdown\b",
    r"\breboot\b",
];

fn dangerous_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DANGEROUS_PATTERN_SOURCES
            .iter()
            .map(|source| Regex::new(source).expect("static pattern"))
            .collect()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    DangerousPattern { pattern: String },
    NotAllowlisted { base: String },
    Empty,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::DangerousPattern { pattern } => {
                write!(f, "command blocked: matches dangerous pattern `{pattern}`")
            }
            BlockReason::NotAllowlisted { base } => {
                write!(f, "command blocked: `{base}` is not in the allowlist")
            }
            BlockReason::Empty => write!(f, "command blocked: empty command line"),
        }
    }
}

/// Returns why a command line must not run, or `None` when it may proceed
/// to the approval gate. Screening happens before approval so the operator
/// is never asked to bless a command the policy already forbids.
pub fn screen_command(command_line: &str) -> Option<BlockReason> {
    let trimmed = command_line.trim();
    if trimmed.is_empty() {
        return Some(BlockReason::Empty);
    }
    for pattern in dangerous_patterns() {
        if pattern.is_match(trimmed) {
            return Some(BlockReason::DangerousPattern {
                pattern: pattern.as_str().to_string(),
            });
        }
    }
    // Every segment of a pipeline or chained command must be allowlisted.
    for segment in split_segments(trimmed) {
        let Some(base) = segment.split_whitespace().next() else {
            continue;
        };
        let base = base.rsplit('/').next().unwrap_or(base);
        if !ALLOWED_COMMANDS.contains(&base) {
            return Some(BlockReason::NotAllowlisted {
                base: base.to_string(),
            });
        }
    }
    None
}

fn split_segments(command_line: &str) -> Vec<&str> {
    command_line
        .split(|c| c == '|' || c == ';')
        .flat_map(|part| part.split("&&"))
        .flat_map(|part| part.split("||"))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

fn requires_shell(command_line: &str) -> bool {
    // Quotes count as well: plain whitespace splitting would hand them to
    // the child as literal argument bytes.
    command_line
        .chars()
        .any(|c| matches!(c, '|' | '>' | '<' | ';' | '&' | '$' | '`' | '*' | '?' | '"' | '\''))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Runs an approved command, capturing output on reader threads and killing
/// the child when the deadline passes. Plain argv lines run directly; lines
/// using shell features go through `sh -c`.
pub fn execute_command(
    command_line: &str,
    working_dir: &Path,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let mut child = spawn(command_line, working_dir)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || read_pipe(stdout));
    let stderr_handle = thread::spawn(move || read_pipe(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(Duration::from_millis(25));
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    match status {
        Some(status) => Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            timed_out: false,
        }),
        None => Ok(CommandOutput {
            exit_code: -1,
            stdout,
            stderr,
            timed_out: true,
        }),
    }
}

fn spawn(command_line: &str, working_dir: &Path) -> std::io::Result<Child> {
    let mut command = if requires_shell(command_line) {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command_line);
        shell
    } else {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let mut direct = Command::new(program);
        direct.args(parts);
        direct
    };
    command
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = String::new();
    let _ = pipe.read_to_string(&mut buffer);
    buffer
}
