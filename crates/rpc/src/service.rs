//! Service side of the RPC protocol: consume a request queue and answer on
//! each request's `reply_to`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obsflow_bus::{Bus, BusError, Inbound, InboundOptions, Message};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{RemoteErrorKind, RpcError};
use crate::protocol::{RpcArgs, RpcReply, RpcRequest};

/// Failure returned by a handler; sent back as `errmsg = kind`,
/// `backtrace = message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }
}

/// Handles one method of a service.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, args: RpcArgs) -> Result<Value, ServiceError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServiceError>> + Send,
{
    async fn handle(&self, args: RpcArgs) -> Result<Value, ServiceError> {
        (self)(args).await
    }
}

pub struct RpcService {
    bus: Arc<dyn Bus>,
    queue: String,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
    poll_interval: Duration,
}

impl RpcService {
    pub fn new(bus: Arc<dyn Bus>, queue: impl Into<String>) -> Self {
        Self {
            bus,
            queue: queue.into(),
            handlers: HashMap::new(),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn register(mut self, method: impl Into<String>, handler: impl RpcHandler + 'static) -> Self {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Serve requests until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), RpcError> {
        let inbound = self
            .bus
            .open_inbound(&self.queue, InboundOptions::durable())
            .await?;
        info!(queue = %self.queue, methods = self.handlers.len(), "rpc service started");

        let result = self.serve(inbound.as_ref(), &shutdown).await;
        inbound.close().await?;
        info!(queue = %self.queue, "rpc service stopped");
        result
    }

    async fn serve(&self, inbound: &dyn Inbound, shutdown: &Notify) -> Result<(), RpcError> {
        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                received = inbound.receive(self.poll_interval) => {
                    if let Some(message) = received? {
                        self.dispatch(message).await;
                    }
                }
            }
        }
    }

    /// Answer one request. Failures to reply are logged, never returned.
    pub async fn dispatch(&self, message: Message) {
        let request: RpcRequest = match message.decode() {
            Ok(r) => r,
            Err(e) => {
                warn!(queue = %self.queue, subject = %message.subject, error = %e, "dropping undecodable request");
                return;
            }
        };

        let reply = self.reply_for(&message.subject, request.args()).await;
        if let Err(e) = self.send_reply(&request.reply_to, &reply).await {
            match e {
                RpcError::Bus(BusError::UnknownDestination(_)) => {
                    debug!(reply_to = %request.reply_to, "caller went away before the reply");
                }
                other => {
                    warn!(reply_to = %request.reply_to, error = %other, "failed to send reply");
                }
            }
        }
    }

    async fn reply_for(&self, method: &str, args: RpcArgs) -> RpcReply {
        let Some(handler) = self.handlers.get(method) else {
            return RpcReply::error(
                RemoteErrorKind::RpcException.as_str(),
                format!("{} has no method '{method}'", self.queue),
            );
        };
        match handler.handle(args).await {
            Ok(content) => RpcReply::ok(content),
            Err(e) => {
                debug!(method, kind = %e.kind, message = %e.message, "handler failed");
                RpcReply::error(e.kind.as_str(), e.message)
            }
        }
    }

    async fn send_reply(&self, reply_to: &str, reply: &RpcReply) -> Result<(), RpcError> {
        let out = self.bus.open_outbound(reply_to).await?;
        out.send(Message::new("reply", reply)?).await?;
        Ok(())
    }
}
