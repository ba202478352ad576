use crate::capability::capability_spec;
use crate::pipeline::PipelineStep;
use crate::shared::ids::StepId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error at {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid step id `{step_id}`: {reason}")]
    InvalidStepId { step_id: String, reason: String },
    #[error("duplicate step id `{step_id}`")]
    DuplicateStepId { step_id: String },
    #[error("step `{step_id}` names unknown capability `{capability}`")]
    UnknownCapability { step_id: String, capability: String },
    #[error("step `{step_id}` depends on `{depends_on}`, which is not an earlier step")]
    UnknownDependency { step_id: String, depends_on: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepConfig {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub records_scan: bool,
}

/// Pipeline configuration loaded from `chbuild.yaml`. An empty step list
/// selects the built-in scan/plan/migrate/validate pipeline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub unattended: bool,
    pub approval_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl PipelineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: Vec<&str> = Vec::new();
        for step in &self.steps {
            StepId::parse(&step.id).map_err(|reason| ConfigError::InvalidStepId {
                step_id: step.id.clone(),
                reason,
            })?;
            if seen.contains(&step.id.as_str()) {
                return Err(ConfigError::DuplicateStepId {
                    step_id: step.id.clone(),
                });
            }
            for capability in &step.capabilities {
                if capability_spec(capability).is_none() {
                    return Err(ConfigError::UnknownCapability {
                        step_id: step.id.clone(),
                        capability: capability.clone(),
                    });
                }
            }
            // Dependencies may only point backwards; the runner walks steps
            // in declaration order.
            for dep in &step.depends_on {
                if !seen.contains(&dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        step_id: step.id.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
            seen.push(&step.id);
        }
        Ok(())
    }

    pub fn pipeline_steps(&self) -> Result<Vec<PipelineStep>, ConfigError> {
        if self.steps.is_empty() {
            return Ok(default_pipeline());
        }
        let mut steps = Vec::with_capacity(self.steps.len());
        for config in &self.steps {
            let id = StepId::parse(&config.id).map_err(|reason| ConfigError::InvalidStepId {
                step_id: config.id.clone(),
                reason,
            })?;
            let mut depends_on = Vec::with_capacity(config.depends_on.len());
            for dep in &config.depends_on {
                depends_on.push(StepId::parse(dep).map_err(|reason| {
                    ConfigError::InvalidStepId {
                        step_id: dep.clone(),
                        reason,
                    }
                })?);
            }
            steps.push(
                PipelineStep::new(id, config.instruction.clone())
                    .with_capabilities(config.capabilities.clone())
                    .with_continue_on_failure(config.continue_on_failure)
                    .with_depends_on(depends_on)
                    .with_records_scan(config.records_scan),
            );
        }
        Ok(steps)
    }
}

/// The built-in migration pipeline: discover analytical queries, plan the
/// data move, rewrite code, then validate the build.
pub fn default_pipeline() -> Vec<PipelineStep> {
    let scan = StepId::parse("scan").expect("static id");
    let plan = StepId::parse("plan").expect("static id");
    let migrate = StepId::parse("migrate").expect("static id");
    let validate = StepId::parse("validate").expect("static id");

    vec![
        PipelineStep::new(
            scan,
            "Survey the workspace for analytical SQL queries (aggregations, \
             window functions, large scans) that should move from Postgres to \
             ClickHouse. Report each site as a JSON array of objects with \
             filePath, lineStart, lineEnd, queryKind, and rawText.",
        )
        .with_capabilities(["search", "glob", "read"])
        .with_records_scan(true),
        PipelineStep::new(
            plan,
            "Propose a data migration plan for the discovered analytical \
             tables: target ClickHouse schemas, ordering keys, and backfill \
             strategy. Ask the operator when a tradeoff needs a decision.",
        )
        .with_capabilities(["read", "ask_human"])
        .with_continue_on_failure(true),
        PipelineStep::new(
            migrate,
            "Rewrite each discovered analytical query site to target \
             ClickHouse. Propose one file change at a time; a declined change \
             is skipped, not retried.",
        )
        .with_capabilities(["search", "glob", "read", "write", "ask_human"]),
        PipelineStep::new(
            validate,
            "Verify the rewritten code still builds: run the project's \
             typecheck or build command and report the outcome.",
        )
        .with_capabilities(["run_command", "read"])
        .with_depends_on(vec![StepId::parse("migrate").expect("static id")]),
    ]
}
