//! RPC round trips through a real broker over TCP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;

use obsflow_bus::transport::Transport;
use obsflow_bus::{BrokerConfig, Bus, BusBroker, ZmqBus};
use obsflow_rpc::{RemoteErrorKind, RpcArgs, RpcClientCache, RpcError, RpcService, ServiceError};

const SETTLE: Duration = Duration::from_millis(200);

async fn start_broker(port: u16) -> tokio::task::JoinHandle<()> {
    let mut config = BrokerConfig::tcp("127.0.0.1", port);
    config.queues = vec!["OTDBService".into()];
    let broker = BusBroker::new(config);
    let handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    tokio::time::sleep(SETTLE).await;
    handle
}

async fn connect(port: u16) -> Arc<dyn Bus> {
    let bus = ZmqBus::connect(&Transport::tcp("127.0.0.1", port))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    Arc::new(bus)
}

fn otdb_service(bus: Arc<dyn Bus>) -> Arc<Notify> {
    let service = RpcService::new(bus, "OTDBService")
        .poll_interval(Duration::from_millis(100))
        .register("GetSpecification", |args: RpcArgs| async move {
            match args.get("OtdbID", 0).and_then(Value::as_i64) {
                Some(id) if id > 0 => Ok(json!({ "id": id })),
                _ => Err(ServiceError::invalid_argument("OtdbID must be positive")),
            }
        });
    let shutdown = Arc::new(Notify::new());
    let stop = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let _ = service.run(stop).await;
    });
    shutdown
}

#[tokio::test]
async fn rpc_round_trip_over_broker() {
    let handle = start_broker(17100).await;
    let shutdown = otdb_service(connect(17100).await);

    let cache = RpcClientCache::new(connect(17100).await);
    let result = cache
        .call_with_timeout(
            "OTDBService",
            "GetSpecification",
            RpcArgs::new().kwarg("OtdbID", 42),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"id": 42}));

    cache.close().await;
    shutdown.notify_one();
    handle.abort();
}

#[tokio::test]
async fn rpc_error_over_broker() {
    let handle = start_broker(17110).await;
    let shutdown = otdb_service(connect(17110).await);

    let cache = RpcClientCache::new(connect(17110).await).with_forward_exceptions(true);
    let err = cache
        .call_with_timeout(
            "OTDBService",
            "GetSpecification",
            RpcArgs::new().arg(-1),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::InvalidArgument));

    shutdown.notify_one();
    handle.abort();
}

#[tokio::test]
async fn rpc_timeout_without_service() {
    let handle = start_broker(17120).await;

    let cache = RpcClientCache::new(connect(17120).await);
    let err = cache
        .call_with_timeout(
            "OTDBService",
            "GetSpecification",
            RpcArgs::new().arg(1),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    handle.abort();
}
