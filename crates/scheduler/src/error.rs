use std::time::Duration;

use thiserror::Error;

/// A task specification that cannot be acted upon. Always fatal for the
/// event that fetched it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecificationError {
    #[error("specification has no '{0}'")]
    MissingField(String),

    #[error("malformed specification: '{key}' = '{value}': {reason}")]
    MalformedSpecification {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown processing cluster '{0}'")]
    UnknownCluster(String),

    #[error("specification must be a key/value object, got {0}")]
    NotAnObject(String),
}

impl SpecificationError {
    pub(crate) fn malformed(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSpecification {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors talking to the batch scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("'{program}' exited with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("unexpected output from '{program}': {output}")]
    UnexpectedOutput { program: String, output: String },

    #[error("no scheduler job named '{0}'")]
    UnresolvedDependency(String),
}
