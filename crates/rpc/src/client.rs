//! Blocking request/reply on top of the bus.

use std::sync::Arc;
use std::time::Duration;

use obsflow_bus::{Bus, Inbound, InboundOptions, Message, Outbound};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RemoteError, RemoteErrorKind, RpcError};
use crate::protocol::{RpcArgs, RpcReply, RpcRequest, REPLY_PREFIX};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Queue requests are sent to. Defaults to the service name.
    pub request_queue: Option<String>,
    /// Map a recognized `errmsg` onto its [`RemoteErrorKind`].
    pub forward_exceptions: bool,
}

/// A client bound to one `(service, method)` pair.
pub struct RpcClient {
    bus: Arc<dyn Bus>,
    service: String,
    method: String,
    outbound: Box<dyn Outbound>,
    forward_exceptions: bool,
}

impl RpcClient {
    pub async fn open(
        bus: Arc<dyn Bus>,
        service: &str,
        method: &str,
        options: ClientOptions,
    ) -> Result<Self, RpcError> {
        let queue = options
            .request_queue
            .unwrap_or_else(|| service.to_string());
        let outbound = bus.open_outbound(&queue).await?;
        Ok(Self {
            bus,
            service: service.to_string(),
            method: method.to_string(),
            outbound,
            forward_exceptions: options.forward_exceptions,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call the remote method and wait at most `timeout` for its reply.
    ///
    /// Returns the reply content with status `"OK"`. A private reply queue is
    /// opened for the call and closed again on every path out of here.
    pub async fn execute(
        &self,
        args: RpcArgs,
        timeout: Duration,
    ) -> Result<(Value, String), RpcError> {
        let reply_to = format!("{REPLY_PREFIX}{}", Uuid::new_v4());
        let inbound = self
            .bus
            .open_inbound(&reply_to, InboundOptions::ephemeral())
            .await?;

        let result = self
            .round_trip(inbound.as_ref(), &reply_to, &args, timeout)
            .await;

        if let Err(e) = inbound.close().await {
            warn!(reply_to = %reply_to, error = %e, "failed to close reply queue");
        }
        result
    }

    async fn round_trip(
        &self,
        inbound: &dyn Inbound,
        reply_to: &str,
        args: &RpcArgs,
        timeout: Duration,
    ) -> Result<(Value, String), RpcError> {
        let request = RpcRequest::new(reply_to, args);
        let message = Message::new(self.method.as_str(), &request)?;
        debug!(
            service = %self.service,
            method = %self.method,
            reply_to,
            "sending rpc request"
        );
        self.outbound.send(message).await?;

        let Some(reply) = inbound.receive(timeout).await? else {
            return Err(RpcError::Timeout {
                service: self.service.clone(),
                method: self.method.clone(),
                timeout,
            });
        };

        let reply: RpcReply = reply.decode().map_err(|e| RpcError::MalformedReply {
            service: self.service.clone(),
            method: self.method.clone(),
            detail: e.to_string(),
        })?;

        if reply.is_ok() {
            return Ok((reply.content, reply.status));
        }
        Err(RpcError::Remote(self.remote_error(reply)))
    }

    fn remote_error(&self, reply: RpcReply) -> RemoteError {
        let errmsg = reply.errmsg.unwrap_or_default();
        let backtrace = reply.backtrace.unwrap_or_default();
        let forwarded = self
            .forward_exceptions
            .then(|| RemoteErrorKind::from_errmsg(&errmsg))
            .flatten();

        match forwarded {
            Some(kind) => RemoteError {
                kind,
                status: reply.status,
                message: backtrace.clone(),
                backtrace,
            },
            None => RemoteError {
                kind: RemoteErrorKind::Generic,
                status: reply.status,
                message: format!("{}.{} failed: {errmsg}", self.service, self.method),
                backtrace,
            },
        }
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.outbound.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use obsflow_bus::MemoryBus;
    use serde_json::json;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    /// Answer one request on `queue` with whatever `reply` builds.
    fn serve_once<F>(bus: MemoryBus, queue: &'static str, reply: F) -> tokio::task::JoinHandle<RpcRequest>
    where
        F: FnOnce(&RpcRequest) -> Message + Send + 'static,
    {
        tokio::spawn(async move {
            let inbound = bus
                .open_inbound(queue, InboundOptions::durable())
                .await
                .unwrap();
            let msg = inbound.receive(WAIT).await.unwrap().expect("no request");
            let request: RpcRequest = msg.decode().unwrap();
            let out = bus.open_outbound(&request.reply_to).await.unwrap();
            out.send(reply(&request)).await.unwrap();
            request
        })
    }

    async fn client(bus: &MemoryBus, forward: bool) -> RpcClient {
        RpcClient::open(
            Arc::new(bus.clone()),
            "OTDBService",
            "GetSpecification",
            ClientOptions {
                request_queue: None,
                forward_exceptions: forward,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn ok_reply_returns_content_and_status() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        let server = serve_once(bus.clone(), "OTDBService", |req| {
            let id = req.args().get("OtdbID", 0).cloned().unwrap_or(Value::Null);
            Message::new("reply", &RpcReply::ok(json!({ "id": id }))).unwrap()
        });

        let client = client(&bus, false).await;
        let (content, status) = client
            .execute(RpcArgs::new().kwarg("OtdbID", 42), WAIT)
            .await
            .unwrap();

        assert_eq!(content, json!({"id": 42}));
        assert_eq!(status, "OK");
        let request = server.await.unwrap();
        assert_eq!(request.content, json!({"OtdbID": 42}));
        assert!(request.reply_to.starts_with("reply."));
        assert_eq!(bus.open_inbounds(), 0);
    }

    #[tokio::test]
    async fn error_reply_carries_backtrace() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        serve_once(bus.clone(), "OTDBService", |_| {
            Message::new("reply", &RpcReply::error("RPCException", "Traceback: boom")).unwrap()
        });

        let client = client(&bus, false).await;
        let err = client.execute(RpcArgs::new(), WAIT).await.unwrap_err();
        match err {
            RpcError::Remote(remote) => {
                assert_eq!(remote.kind, RemoteErrorKind::Generic);
                assert_eq!(remote.status, "ERROR");
                assert!(remote.message.contains("RPCException"));
                assert_eq!(remote.backtrace, "Traceback: boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(bus.open_inbounds(), 0);
    }

    #[tokio::test]
    async fn forwarded_error_uses_known_kind() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        serve_once(bus.clone(), "OTDBService", |_| {
            Message::new("reply", &RpcReply::error("NotFound", "no tree 42")).unwrap()
        });

        let client = client(&bus, true).await;
        let err = client.execute(RpcArgs::new().arg(42), WAIT).await.unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::NotFound));
        let RpcError::Remote(remote) = err else {
            unreachable!()
        };
        assert_eq!(remote.message, "no tree 42");
        assert_eq!(remote.backtrace, "no tree 42");
    }

    #[tokio::test]
    async fn forwarded_unknown_errmsg_stays_generic() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        serve_once(bus.clone(), "OTDBService", |_| {
            Message::new("reply", &RpcReply::error("KeyError", "'treeID'")).unwrap()
        });

        let client = client(&bus, true).await;
        let err = client.execute(RpcArgs::new(), WAIT).await.unwrap_err();
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::Generic));
        assert!(err.to_string().contains("KeyError"));
    }

    #[tokio::test]
    async fn timeout_closes_reply_queue() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();

        let client = client(&bus, false).await;
        let err = client
            .execute(RpcArgs::new().arg(1), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(bus.open_inbounds(), 0);
        assert_eq!(bus.stats().inbounds_closed.load(Ordering::SeqCst), 1);
        // The request itself is still waiting for a server.
        assert_eq!(bus.queue_len("OTDBService"), Some(1));
    }

    #[tokio::test]
    async fn malformed_reply_is_rejected() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        serve_once(bus.clone(), "OTDBService", |_| {
            Message::new("reply", &"not a reply").unwrap()
        });

        let client = client(&bus, false).await;
        let err = client.execute(RpcArgs::new(), WAIT).await.unwrap_err();
        assert!(matches!(err, RpcError::MalformedReply { .. }));
        assert_eq!(bus.open_inbounds(), 0);
    }

    #[tokio::test]
    async fn send_failure_closes_reply_queue() {
        // No request queue declared: the send is unroutable.
        let bus = MemoryBus::new();
        let client = client(&bus, false).await;

        let err = client.execute(RpcArgs::new(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Bus(obsflow_bus::BusError::UnknownDestination(_))
        ));
        assert_eq!(bus.open_inbounds(), 0);
    }
}
