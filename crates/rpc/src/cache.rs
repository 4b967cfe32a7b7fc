//! One open [`RpcClient`] per `(service, method)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use obsflow_bus::{Bus, BusConfig};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::{ClientOptions, RpcClient};
use crate::error::RpcError;
use crate::protocol::{RpcArgs, STATUS_OK};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
struct ServiceRoute {
    queue: Option<String>,
    timeout: Option<Duration>,
}

struct State {
    clients: HashMap<(String, String), Arc<RpcClient>>,
    closed: bool,
}

/// Caches bound clients and turns any non-OK outcome into an error.
///
/// Owned by whoever makes the calls; [`close`](Self::close) releases every
/// client and makes further calls fail with [`RpcError::Closed`].
pub struct RpcClientCache {
    bus: Arc<dyn Bus>,
    routes: HashMap<String, ServiceRoute>,
    default_timeout: Duration,
    forward_exceptions: bool,
    state: Mutex<State>,
}

impl RpcClientCache {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            routes: HashMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
            forward_exceptions: false,
            state: Mutex::new(State {
                clients: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Take request queues and timeouts from the `[services.*]` sections.
    pub fn with_services(mut self, config: &BusConfig) -> Self {
        for name in config.services.keys() {
            self.routes.insert(
                name.clone(),
                ServiceRoute {
                    queue: Some(config.service_queue(name)),
                    timeout: config.service_timeout(name),
                },
            );
        }
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_forward_exceptions(mut self, forward: bool) -> Self {
        self.forward_exceptions = forward;
        self
    }

    /// Reply timeout used by [`call`](Self::call) for `service`.
    pub fn timeout_for(&self, service: &str) -> Duration {
        self.routes
            .get(service)
            .and_then(|r| r.timeout)
            .unwrap_or(self.default_timeout)
    }

    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: RpcArgs,
    ) -> Result<Value, RpcError> {
        self.call_with_timeout(service, method, args, self.timeout_for(service))
            .await
    }

    /// Call `"Service.Method"`.
    pub async fn call_qualified(&self, qualified: &str, args: RpcArgs) -> Result<Value, RpcError> {
        let (service, method) = split_qualified(qualified)?;
        self.call(service, method, args).await
    }

    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: RpcArgs,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let client = self.client(service, method).await?;
        let (content, status) = client.execute(args, timeout).await?;
        if status != STATUS_OK {
            return Err(RpcError::UnexpectedStatus(status));
        }
        Ok(content)
    }

    /// [`call_with_timeout`](Self::call_with_timeout) decoding the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: RpcArgs,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let content = self.call_with_timeout(service, method, args, timeout).await?;
        Ok(serde_json::from_value(content)?)
    }

    async fn client(&self, service: &str, method: &str) -> Result<Arc<RpcClient>, RpcError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RpcError::Closed);
        }
        let key = (service.to_string(), method.to_string());
        if let Some(client) = state.clients.get(&key) {
            return Ok(Arc::clone(client));
        }

        let options = ClientOptions {
            request_queue: self.routes.get(service).and_then(|r| r.queue.clone()),
            forward_exceptions: self.forward_exceptions,
        };
        let client = Arc::new(RpcClient::open(Arc::clone(&self.bus), service, method, options).await?);
        debug!(service, method, "opened rpc client");
        state.clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Release every cached client. Safe to call more than once.
    pub async fn close(&self) {
        let clients = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.clients)
        };
        for ((service, method), client) in clients {
            if let Err(e) = client.close().await {
                warn!(service = %service, method = %method, error = %e, "failed to close rpc client");
            }
        }
    }
}

fn split_qualified(qualified: &str) -> Result<(&str, &str), RpcError> {
    match qualified.rsplit_once('.') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(RpcError::InvalidMethod(qualified.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use obsflow_bus::{InboundOptions, MemoryBus, Message};
    use serde_json::json;

    use super::*;
    use crate::protocol::{RpcReply, RpcRequest};

    /// Answer `count` requests on `queue` with `{"method": <subject>}`.
    fn echo_server(bus: MemoryBus, queue: &'static str, count: usize) {
        tokio::spawn(async move {
            let inbound = bus
                .open_inbound(queue, InboundOptions::durable())
                .await
                .unwrap();
            for _ in 0..count {
                let msg = inbound
                    .receive(Duration::from_secs(2))
                    .await
                    .unwrap()
                    .expect("no request");
                let request: RpcRequest = msg.decode().unwrap();
                let reply = RpcReply::ok(json!({ "method": msg.subject }));
                let out = bus.open_outbound(&request.reply_to).await.unwrap();
                out.send(Message::new("reply", &reply).unwrap()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn clients_are_reused_per_method() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        echo_server(bus.clone(), "OTDBService", 3);

        let cache = RpcClientCache::new(Arc::new(bus.clone()));
        let a = cache
            .call("OTDBService", "GetSpecification", RpcArgs::new().arg(1))
            .await
            .unwrap();
        cache
            .call_qualified("OTDBService.GetSpecification", RpcArgs::new().arg(2))
            .await
            .unwrap();
        let b = cache
            .call("OTDBService", "SetTaskStatus", RpcArgs::new().arg(1))
            .await
            .unwrap();

        assert_eq!(a, json!({"method": "GetSpecification"}));
        assert_eq!(b, json!({"method": "SetTaskStatus"}));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn call_as_decodes_result() {
        #[derive(serde::Deserialize)]
        struct Echo {
            method: String,
        }

        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        echo_server(bus.clone(), "OTDBService", 1);

        let cache = RpcClientCache::new(Arc::new(bus));
        let echo: Echo = cache
            .call_as(
                "OTDBService",
                "SetTaskStatus",
                RpcArgs::new(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(echo.method, "SetTaskStatus");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let bus = MemoryBus::new();
        bus.declare_queue("OTDBService").unwrap();
        echo_server(bus.clone(), "OTDBService", 1);

        let cache = RpcClientCache::new(Arc::new(bus));
        cache
            .call("OTDBService", "GetSpecification", RpcArgs::new())
            .await
            .unwrap();

        cache.close().await;
        cache.close().await;
        assert!(cache.is_closed().await);
        assert_eq!(cache.len().await, 0);

        let err = cache
            .call("OTDBService", "GetSpecification", RpcArgs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Closed));
    }

    #[tokio::test]
    async fn configured_routes_pick_queue_and_timeout() {
        let config = BusConfig::from_toml(
            r#"
[services.OTDBService]
queue = "otdb.requests"
timeout_secs = 3
"#,
        )
        .unwrap();

        let bus = MemoryBus::new();
        bus.declare_queue("otdb.requests").unwrap();
        echo_server(bus.clone(), "otdb.requests", 1);

        let cache = RpcClientCache::new(Arc::new(bus)).with_services(&config);
        assert_eq!(cache.timeout_for("OTDBService"), Duration::from_secs(3));
        assert_eq!(cache.timeout_for("Other"), DEFAULT_TIMEOUT);
        cache
            .call("OTDBService", "GetSpecification", RpcArgs::new())
            .await
            .unwrap();
    }

    #[test]
    fn qualified_names_need_both_parts() {
        assert_eq!(
            split_qualified("OTDBService.SetTaskStatus").unwrap(),
            ("OTDBService", "SetTaskStatus")
        );
        assert!(split_qualified("OTDBService").is_err());
        assert!(split_qualified(".SetTaskStatus").is_err());
    }
}
