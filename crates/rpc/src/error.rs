use std::fmt;
use std::time::Duration;

use obsflow_bus::BusError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds shared by callers and services through the `errmsg` field of
/// an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Catch-all raised by the RPC layer itself, e.g. for an unknown method.
    RpcException,
    /// The service gave up waiting on something it depends on.
    RpcTimeout,
    /// Arguments were missing or of the wrong shape.
    InvalidArgument,
    /// The requested entity does not exist.
    NotFound,
    /// Anything a caller does not recognize.
    Generic,
}

impl RemoteErrorKind {
    /// Name sent as `errmsg`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RpcException => "RPCException",
            Self::RpcTimeout => "RPCTimeoutException",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Generic => "Generic",
        }
    }

    /// Recognize an `errmsg`. Returns `None` for names this side does not
    /// know.
    pub fn from_errmsg(errmsg: &str) -> Option<Self> {
        match errmsg {
            "RPCException" => Some(Self::RpcException),
            "RPCTimeoutException" => Some(Self::RpcTimeout),
            "InvalidArgument" => Some(Self::InvalidArgument),
            "NotFound" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-OK reply, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: String,
    pub message: String,
    pub backtrace: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status, self.message)?;
        if !self.backtrace.is_empty() {
            write!(f, "\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Errors that can occur performing a remote call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{service}.{method} did not reply within {timeout:?}")]
    Timeout {
        service: String,
        method: String,
        timeout: Duration,
    },

    #[error("malformed reply from {service}.{method}: {detail}")]
    MalformedReply {
        service: String,
        method: String,
        detail: String,
    },

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("call returned status '{0}'")]
    UnexpectedStatus(String),

    #[error("invalid method name '{0}', expected Service.Method")]
    InvalidMethod(String),

    #[error("could not decode result: {0}")]
    Result(#[from] serde_json::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("rpc client cache is closed")]
    Closed,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote(remote) => Some(remote.kind),
            _ => None,
        }
    }
}
