use super::types::{ControllerConfig, RunnerKind};
use crate::error::ConfigError;

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_otdb()?;
        self.validate_slurm()?;
        self.validate_pipeline()?;
        Ok(())
    }

    fn validate_otdb(&self) -> Result<(), ConfigError> {
        if self.otdb.service.trim().is_empty() {
            return Err(ConfigError::Invalid("otdb.service must not be empty".into()));
        }
        if self.otdb.notification_exchange.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "otdb.notification_exchange must not be empty".into(),
            ));
        }
        if self.otdb.specification_timeout_secs == 0 || self.otdb.status_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "otdb timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn validate_slurm(&self) -> Result<(), ConfigError> {
        if self.slurm.runner == RunnerKind::Ssh && self.slurm.host.is_none() {
            return Err(ConfigError::Invalid(
                "slurm.host is required for the ssh runner".into(),
            ));
        }
        if self.slurm.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "slurm.command_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        for (name, template) in [
            ("run_command", &self.pipeline.run_command),
            ("abort_command", &self.pipeline.abort_command),
        ] {
            if template.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pipeline.{name} must not be empty"
                )));
            }
        }
        if self.pipeline.receive_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.receive_poll_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
