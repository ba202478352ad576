pub mod cli;
pub mod session;

use crate::pipeline::RunStore;
use cli::{CliVerb, StatusOptions};

/// CLI entry point: parses the verb, runs it, and returns the text to
/// print. Errors come back as plain strings for the binary to report.
pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let Some(verb) = args.first() else {
        return Ok(cli::cli_help_lines().join("\n"));
    };
    match cli::parse_cli_verb(verb) {
        CliVerb::Help => Ok(cli::cli_help_lines().join("\n")),
        CliVerb::Run => {
            let options = cli::parse_run_options(&args[1..])?;
            session::run_interactive(&options).map_err(|err| err.to_string())
        }
        CliVerb::Status => {
            let options = cli::parse_status_options(&args[1..])?;
            render_status(&options).map_err(|err| err.to_string())
        }
        CliVerb::Unknown => Err(format!(
            "unknown command `{verb}`\n{}",
            cli::cli_help_lines().join("\n")
        )),
    }
}

fn render_status(options: &StatusOptions) -> Result<String, String> {
    let state_root = options.path.join(session::STATE_DIR_NAME);
    let store = RunStore::new(&state_root);
    let run_id = match &options.run_id {
        Some(run_id) => run_id.clone(),
        None => store
            .latest_run_id()
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("no runs recorded under {}", state_root.display()))?,
    };
    let record = store.load(&run_id).map_err(|err| err.to_string())?;

    let mut lines = vec![
        format!("run {}: {}", record.run_id, record.state),
        format!("workspace: {}", record.workspace_root),
    ];
    for step in &record.steps {
        lines.push(format!("  {}: {}", step.id, step.state));
    }
    Ok(lines.join("\n"))
}
