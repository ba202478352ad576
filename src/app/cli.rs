use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Status,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "status" => CliVerb::Status,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub path: PathBuf,
    pub config: Option<PathBuf>,
    pub unattended: bool,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOptions {
    pub path: PathBuf,
    pub run_id: Option<String>,
}

pub fn parse_run_options(args: &[String]) -> Result<RunOptions, String> {
    let mut options = RunOptions {
        path: PathBuf::from("."),
        config: None,
        unattended: false,
        run_id: None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--path" => {
                options.path = PathBuf::from(take_value(&mut iter, "--path")?);
            }
            "--config" => {
                options.config = Some(PathBuf::from(take_value(&mut iter, "--config")?));
            }
            "--run-id" => {
                options.run_id = Some(take_value(&mut iter, "--run-id")?);
            }
            "--unattended" | "--yes" => {
                options.unattended = true;
            }
            other => return Err(format!("unknown argument for run: `{other}`")),
        }
    }
    Ok(options)
}

pub fn parse_status_options(args: &[String]) -> Result<StatusOptions, String> {
    let mut options = StatusOptions {
        path: PathBuf::from("."),
        run_id: None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--path" => {
                options.path = PathBuf::from(take_value(&mut iter, "--path")?);
            }
            "--run-id" => {
                options.run_id = Some(take_value(&mut iter, "--run-id")?);
            }
            other => return Err(format!("unknown argument for status: `{other}`")),
        }
    }
    Ok(options)
}

fn take_value(iter: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<String, String> {
    iter.next()
        .map(|value| value.to_string())
        .ok_or_else(|| format!("{flag} requires a value"))
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Commands:".to_string(),
        "  run [--path DIR] [--config FILE] [--run-id ID] [--unattended|--yes]".to_string(),
        "      Run the migration pipeline against a workspace. Every file write".to_string(),
        "      and command execution pauses for approval unless --unattended.".to_string(),
        "  status [--path DIR] [--run-id ID]".to_string(),
        "      Show the step states of the latest (or given) run.".to_string(),
        "  help".to_string(),
        "      Print this help.".to_string(),
    ]
}
