//! Calls into the task database service.

use std::time::Duration;

use obsflow_rpc::{RpcArgs, RpcClientCache};
use obsflow_scheduler::TaskSpecification;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::status::TaskStatus;

pub const METHOD_GET_SPECIFICATION: &str = "GetSpecification";
pub const METHOD_SET_TASK_STATUS: &str = "SetTaskStatus";

/// Task database client. Owns the RPC cache, so closing this closes every
/// client it opened.
pub struct OtdbClient {
    rpc: RpcClientCache,
    service: String,
    specification_timeout: Duration,
    status_timeout: Duration,
}

impl OtdbClient {
    pub fn new(
        rpc: RpcClientCache,
        service: impl Into<String>,
        specification_timeout: Duration,
        status_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            service: service.into(),
            specification_timeout,
            status_timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Fetch and validate a task's specification. Every failure, a reply
    /// timeout included, is returned.
    pub async fn get_specification(
        &self,
        task_id: u32,
    ) -> Result<TaskSpecification, ControllerError> {
        let reply = self
            .rpc
            .call_with_timeout(
                &self.service,
                METHOD_GET_SPECIFICATION,
                RpcArgs::new().kwarg("OtdbID", task_id),
                self.specification_timeout,
            )
            .await
            .map_err(|source| ControllerError::FetchSpecification { task_id, source })?;

        let spec = TaskSpecification::from_reply(task_id, &reply)
            .map_err(|source| ControllerError::InvalidSpecification { task_id, source })?;
        debug!(task_id, kind = ?spec.kind(), cluster = %spec.cluster_target().target, "fetched specification");
        Ok(spec)
    }

    /// Record a new status. A reply timeout only means the database was
    /// slow, so it is logged and treated as success.
    pub async fn set_status(&self, task_id: u32, status: TaskStatus) -> Result<(), ControllerError> {
        let result = self
            .rpc
            .call_with_timeout(
                &self.service,
                METHOD_SET_TASK_STATUS,
                RpcArgs::new()
                    .kwarg("OtdbID", task_id)
                    .kwarg("NewStatus", status.as_str()),
                self.status_timeout,
            )
            .await;

        match result {
            Ok(_) => {
                info!(task_id, status = %status, "task status updated");
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                warn!(task_id, status = %status, error = %e, "no reply to status update, continuing");
                Ok(())
            }
            Err(source) => Err(ControllerError::SetStatus { task_id, source }),
        }
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }

    pub async fn is_closed(&self) -> bool {
        self.rpc.is_closed().await
    }
}
