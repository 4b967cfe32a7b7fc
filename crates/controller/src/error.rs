use obsflow_bus::BusError;
use obsflow_rpc::RpcError;
use obsflow_scheduler::{SchedulerError, SpecificationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why handling one event for one task failed. Each variant names the step
/// that failed.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("task {task_id}: fetching specification failed: {source}")]
    FetchSpecification {
        task_id: u32,
        #[source]
        source: RpcError,
    },

    #[error("task {task_id}: invalid specification: {source}")]
    InvalidSpecification {
        task_id: u32,
        #[source]
        source: SpecificationError,
    },

    #[error("task {task_id}: predecessor {predecessor}: {source}")]
    Predecessor {
        task_id: u32,
        predecessor: u32,
        #[source]
        source: Box<ControllerError>,
    },

    #[error("task {task_id}: resolving dependency failed: {source}")]
    ResolveDependency {
        task_id: u32,
        #[source]
        source: SchedulerError,
    },

    #[error("task {task_id}: looking up job '{job_name}' failed: {source}")]
    LookupJob {
        task_id: u32,
        job_name: String,
        #[source]
        source: SchedulerError,
    },

    #[error("task {task_id}: submitting job '{job_name}' failed: {source}")]
    Submit {
        task_id: u32,
        job_name: String,
        #[source]
        source: SchedulerError,
    },

    #[error("task {task_id}: setting status failed: {source}")]
    SetStatus {
        task_id: u32,
        #[source]
        source: RpcError,
    },

    #[error("notification subscription failed: {0}")]
    Subscription(#[from] BusError),
}

impl ControllerError {
    /// Short name of the failed step, for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::FetchSpecification { .. } => "fetch specification",
            Self::InvalidSpecification { .. } => "parse specification",
            Self::Predecessor { .. } => "fetch predecessor",
            Self::ResolveDependency { .. } => "resolve dependency",
            Self::LookupJob { .. } => "look up job",
            Self::Submit { .. } => "submit job",
            Self::SetStatus { .. } => "set status",
            Self::Subscription(_) => "subscription",
        }
    }
}
