use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use super::types::{ControllerConfig, RunnerKind};
use crate::error::ConfigError;

#[test]
fn defaults_match_production_values() {
    let cfg = ControllerConfig::from_toml("").unwrap();
    assert_eq!(cfg.otdb.service, "OTDBService");
    assert_eq!(cfg.notification_address(), "otdb.notification/TaskStatus.");
    assert_eq!(cfg.pipeline.start_margin_secs, 60);
    assert_eq!(cfg.pipeline.run_command, "runPipeline.sh -o {task_id}");
    assert_eq!(
        cfg.pipeline.abort_command,
        "setOTDBTreeStatus -o {task_id} -s aborted"
    );
    assert_eq!(cfg.slurm.runner, RunnerKind::Local);
    assert!(cfg.otdb.forward_exceptions);
}

#[test]
fn parse_full_toml_ignoring_bus_sections() {
    let toml = r#"
[bus]
endpoint = "tcp://broker:6000"

[services.OTDBService]
timeout_secs = 5

[otdb]
service = "OTDB"
notification_exchange = "lofar.otdb.notification"
specification_timeout_secs = 20
status_timeout_secs = 3
forward_exceptions = false

[slurm]
runner = "ssh"
host = "head01.cep4"
user = "lofarsys"
command_timeout_secs = 30

[pipeline]
start_margin_secs = 120
run_command = "docker-run-pipeline {job_name}"
receive_poll_ms = 250
"#;
    let cfg = ControllerConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.otdb.service, "OTDB");
    assert_eq!(cfg.specification_timeout(), Duration::from_secs(20));
    assert_eq!(cfg.status_timeout(), Duration::from_secs(3));
    assert!(!cfg.otdb.forward_exceptions);
    assert_eq!(cfg.slurm.runner, RunnerKind::Ssh);
    assert_eq!(cfg.slurm.host.as_deref(), Some("head01.cep4"));

    let settings = cfg.controller_settings();
    assert_eq!(settings.start_margin, chrono::Duration::seconds(120));
    assert_eq!(settings.run_command, "docker-run-pipeline {job_name}");
    assert_eq!(settings.poll_interval, Duration::from_millis(250));
    assert_eq!(
        settings.notification_address,
        "lofar.otdb.notification/TaskStatus."
    );
    assert!(cfg.build_runner().is_ok());
}

#[test]
fn ssh_runner_needs_host() {
    let err = ControllerConfig::from_toml("[slurm]\nrunner = \"ssh\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("slurm.host")));
}

#[test]
fn unknown_runner_is_a_parse_error() {
    assert!(matches!(
        ControllerConfig::from_toml("[slurm]\nrunner = \"telnet\"\n"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn empty_template_is_rejected() {
    let err = ControllerConfig::from_toml("[pipeline]\nabort_command = \"  \"\n").unwrap_err();
    assert!(err.to_string().contains("pipeline.abort_command"));
}

#[test]
fn overrides_replace_file_values() {
    let mut cfg = ControllerConfig::default();
    let env: HashMap<&str, &str> = [
        ("OBSFLOW_OTDB_SERVICE", "OTDB2"),
        ("OBSFLOW_SLURM_RUNNER", "SSH"),
        ("OBSFLOW_SLURM_HOST", "head02"),
        ("OBSFLOW_PIPELINE_START_MARGIN_SECS", "90"),
        ("OBSFLOW_OTDB_STATUS_TIMEOUT_SECS", "soon"),
    ]
    .into_iter()
    .collect();
    cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

    assert_eq!(cfg.otdb.service, "OTDB2");
    assert_eq!(cfg.slurm.runner, RunnerKind::Ssh);
    assert_eq!(cfg.slurm.host.as_deref(), Some("head02"));
    assert_eq!(cfg.pipeline.start_margin_secs, 90);
    assert_eq!(cfg.otdb.status_timeout_secs, 10);
    cfg.validate().unwrap();
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[pipeline]\nstart_margin_secs = 30").unwrap();
    let cfg = ControllerConfig::from_file(file.path()).unwrap();
    assert_eq!(cfg.pipeline.start_margin_secs, 30);
}
