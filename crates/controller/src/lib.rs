pub mod config;
pub mod controller;
pub mod error;
pub mod otdb;
pub mod status;

pub use config::{ControllerConfig, OtdbSection, PipelineSection, RunnerKind, SlurmSection};
pub use controller::{Controller, ControllerSettings, ScheduleOutcome};
pub use error::{ConfigError, ControllerError};
pub use otdb::OtdbClient;
pub use status::{TaskStatus, TaskStatusNotification, STATUS_SUBJECT_PREFIX};
