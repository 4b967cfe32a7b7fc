use std::path::Path;
use std::time::Duration;

use obsflow_scheduler::{CommandRunner, LocalRunner, SshRunner};

use super::types::{ControllerConfig, RunnerKind};
use crate::controller::ControllerSettings;
use crate::error::ConfigError;

impl ControllerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn specification_timeout(&self) -> Duration {
        Duration::from_secs(self.otdb.specification_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.otdb.status_timeout_secs)
    }

    /// Address of the status-change subscription.
    pub fn notification_address(&self) -> String {
        format!(
            "{}/{}",
            self.otdb.notification_exchange,
            crate::status::STATUS_SUBJECT_PREFIX
        )
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            start_margin: chrono::Duration::seconds(self.pipeline.start_margin_secs as i64),
            run_command: self.pipeline.run_command.clone(),
            abort_command: self.pipeline.abort_command.clone(),
            notification_address: self.notification_address(),
            poll_interval: Duration::from_millis(self.pipeline.receive_poll_ms),
        }
    }

    /// Runner for the configured `[slurm]` mode.
    pub fn build_runner(&self) -> Result<Box<dyn CommandRunner>, ConfigError> {
        let timeout = Duration::from_secs(self.slurm.command_timeout_secs);
        match self.slurm.runner {
            RunnerKind::Local => Ok(Box::new(LocalRunner::new(timeout))),
            RunnerKind::Ssh => {
                let host = self.slurm.host.clone().ok_or_else(|| {
                    ConfigError::Invalid("slurm.host is required for the ssh runner".into())
                })?;
                Ok(Box::new(SshRunner::new(host, self.slurm.user.clone(), timeout)))
            }
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `OBSFLOW_SECTION_KEY` overrides `section.key`, e.g.
    /// `OBSFLOW_OTDB_SERVICE`, `OBSFLOW_SLURM_RUNNER`, `OBSFLOW_SLURM_HOST`,
    /// `OBSFLOW_PIPELINE_START_MARGIN_SECS`.
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("OBSFLOW_OTDB_SERVICE") {
            self.otdb.service = v;
        }
        if let Some(v) = lookup("OBSFLOW_OTDB_NOTIFICATION_EXCHANGE") {
            self.otdb.notification_exchange = v;
        }
        if let Some(secs) = parsed(&lookup, "OBSFLOW_OTDB_SPECIFICATION_TIMEOUT_SECS") {
            self.otdb.specification_timeout_secs = secs;
        }
        if let Some(secs) = parsed(&lookup, "OBSFLOW_OTDB_STATUS_TIMEOUT_SECS") {
            self.otdb.status_timeout_secs = secs;
        }
        if let Some(v) = lookup("OBSFLOW_SLURM_RUNNER") {
            match v.to_ascii_lowercase().as_str() {
                "local" => self.slurm.runner = RunnerKind::Local,
                "ssh" => self.slurm.runner = RunnerKind::Ssh,
                other => tracing::warn!(value = other, "ignoring unknown OBSFLOW_SLURM_RUNNER"),
            }
        }
        if let Some(v) = lookup("OBSFLOW_SLURM_HOST") {
            self.slurm.host = Some(v);
        }
        if let Some(v) = lookup("OBSFLOW_SLURM_USER") {
            self.slurm.user = Some(v);
        }
        if let Some(secs) = parsed(&lookup, "OBSFLOW_SLURM_COMMAND_TIMEOUT_SECS") {
            self.slurm.command_timeout_secs = secs;
        }
        if let Some(secs) = parsed(&lookup, "OBSFLOW_PIPELINE_START_MARGIN_SECS") {
            self.pipeline.start_margin_secs = secs;
        }
    }
}

fn parsed(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|v| v.parse().ok())
}
