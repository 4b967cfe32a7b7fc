use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub otdb: OtdbSection,

    #[serde(default)]
    pub slurm: SlurmSection,

    #[serde(default)]
    pub pipeline: PipelineSection,
}

// ── Section configs ─────────────────────────────────────────────────

/// Task database: its RPC service and its notification exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtdbSection {
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default = "default_notification_exchange")]
    pub notification_exchange: String,

    /// Reply timeout for `GetSpecification`. A timeout drops the event.
    #[serde(default = "default_timeout_secs")]
    pub specification_timeout_secs: u64,

    /// Reply timeout for `SetTaskStatus`. A timeout is logged and ignored.
    #[serde(default = "default_timeout_secs")]
    pub status_timeout_secs: u64,

    /// Map known remote error names onto typed error kinds.
    #[serde(default = "default_true")]
    pub forward_exceptions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Local,
    Ssh,
}

/// Where and how Slurm commands are run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmSection {
    #[serde(default)]
    pub runner: RunnerKind,

    /// Head node for the `ssh` runner.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// What gets submitted for a pipeline task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Added to the latest predecessor observation's stop time.
    #[serde(default = "default_start_margin_secs")]
    pub start_margin_secs: u64,

    /// Primary job command. `{task_id}` and `{job_name}` are substituted.
    #[serde(default = "default_run_command")]
    pub run_command: String,

    /// Companion job command, run only if the primary job does not succeed.
    #[serde(default = "default_abort_command")]
    pub abort_command: String,

    /// How often the event loop wakes up to check for shutdown.
    #[serde(default = "default_receive_poll_ms")]
    pub receive_poll_ms: u64,
}

// ── Defaults ────────────────────────────────────────────────────────

fn default_service() -> String {
    "OTDBService".into()
}

fn default_notification_exchange() -> String {
    "otdb.notification".into()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_start_margin_secs() -> u64 {
    60
}

fn default_run_command() -> String {
    "runPipeline.sh -o {task_id}".into()
}

fn default_abort_command() -> String {
    "setOTDBTreeStatus -o {task_id} -s aborted".into()
}

fn default_receive_poll_ms() -> u64 {
    500
}

impl Default for OtdbSection {
    fn default() -> Self {
        Self {
            service: default_service(),
            notification_exchange: default_notification_exchange(),
            specification_timeout_secs: default_timeout_secs(),
            status_timeout_secs: default_timeout_secs(),
            forward_exceptions: true,
        }
    }
}

impl Default for SlurmSection {
    fn default() -> Self {
        Self {
            runner: RunnerKind::Local,
            host: None,
            user: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            start_margin_secs: default_start_margin_secs(),
            run_command: default_run_command(),
            abort_command: default_abort_command(),
            receive_poll_ms: default_receive_poll_ms(),
        }
    }
}
