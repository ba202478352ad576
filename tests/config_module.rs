use chbuild::config::{default_pipeline, ConfigError, PipelineConfig};
use std::fs;

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("chbuild.yaml");
    fs::write(&path, content).expect("write config");
    path
}

#[test]
fn full_config_parses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
unattended: true
approval_timeout_secs: 120
engine:
  program: /usr/local/bin/migration-engine
  args: ["--model", "default"]
steps:
  - id: scan
    instruction: find analytical queries
    capabilities: [search, glob, read]
    records_scan: true
  - id: migrate
    instruction: rewrite them
    capabilities: [read, write]
  - id: validate
    instruction: typecheck
    capabilities: [run_command]
    depends_on: [migrate]
"#,
    );

    let config = PipelineConfig::from_path(&path).expect("parse");
    assert!(config.unattended);
    assert_eq!(config.approval_timeout_secs, Some(120));
    let steps = config.pipeline_steps().expect("steps");
    assert_eq!(steps.len(), 3);
    assert!(steps[0].records_scan);
    assert_eq!(steps[2].depends_on.len(), 1);
}

#[test]
fn empty_step_list_selects_the_default_pipeline() {
    let config = PipelineConfig::default();
    let steps = config.pipeline_steps().expect("steps");
    let ids: Vec<&str> = steps.iter().map(|step| step.id.as_str()).collect();
    assert_eq!(ids, vec!["scan", "plan", "migrate", "validate"]);
}

#[test]
fn default_pipeline_scopes_capabilities_per_step() {
    let steps = default_pipeline();
    let scan = &steps[0];
    assert!(scan.capabilities.contains("search"));
    assert!(!scan.capabilities.contains("write"));
    assert!(scan.records_scan);

    let migrate = &steps[2];
    assert!(migrate.capabilities.contains("write"));

    let validate = &steps[3];
    assert!(validate.capabilities.contains("run_command"));
    assert_eq!(validate.depends_on[0].as_str(), "migrate");
}

#[test]
fn duplicate_step_ids_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
steps:
  - id: scan
    instruction: a
  - id: scan
    instruction: b
"#,
    );

    match PipelineConfig::from_path(&path) {
        Err(ConfigError::DuplicateStepId { step_id }) => assert_eq!(step_id, "scan"),
        other => panic!("expected duplicate id error, got {other:?}"),
    }
}

#[test]
fn unknown_capability_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
steps:
  - id: scan
    instruction: a
    capabilities: [telepathy]
"#,
    );

    assert!(matches!(
        PipelineConfig::from_path(&path),
        Err(ConfigError::UnknownCapability { .. })
    ));
}

#[test]
fn forward_dependencies_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
steps:
  - id: first
    instruction: a
    depends_on: [second]
  - id: second
    instruction: b
"#,
    );

    assert!(matches!(
        PipelineConfig::from_path(&path),
        Err(ConfigError::UnknownDependency { .. })
    ));
}

#[test]
fn invalid_step_ids_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
steps:
  - id: "bad step"
    instruction: a
"#,
    );

    assert!(matches!(
        PipelineConfig::from_path(&path),
        Err(ConfigError::InvalidStepId { .. })
    ));
}
