//! Broker metrics and their HTTP exposure.
//!
//! Tracks per-destination message/byte totals, fetch/requeue counters and
//! the queue count, served as JSON from `GET /metrics`. `GET /health`
//! answers `ok` while the broker loop is alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DestinationMetrics {
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Sends that failed because the destination was not declared.
    pub unroutable: u64,
}

/// JSON body of `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub destinations: HashMap<String, DestinationMetrics>,
    pub total_messages: u64,
    pub deliveries: u64,
    pub requeued: u64,
    pub queues: usize,
    pub uptime_secs: f64,
}

#[derive(Debug, Default)]
struct Inner {
    destinations: HashMap<String, DestinationMetrics>,
    total_messages: u64,
    deliveries: u64,
    requeued: u64,
    queues: usize,
}

/// Thread-safe metrics collector shared between the broker loop and the
/// HTTP server.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            start: Instant::now(),
        }
    }

    pub async fn record_send(&self, destination: &str, byte_size: u64) {
        let mut inner = self.inner.lock().await;
        inner.total_messages += 1;
        let stats = inner.destinations.entry(destination.to_string()).or_default();
        stats.total_messages += 1;
        stats.total_bytes += byte_size;
    }

    pub async fn record_unroutable(&self, destination: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .destinations
            .entry(destination.to_string())
            .or_default()
            .unroutable += 1;
    }

    pub async fn record_delivery(&self) {
        self.inner.lock().await.deliveries += 1;
    }

    pub async fn record_requeue(&self) {
        self.inner.lock().await.requeued += 1;
    }

    pub async fn set_queue_count(&self, queues: usize) {
        self.inner.lock().await.queues = queues;
    }

    pub async fn snapshot(&self) -> MetricsResponse {
        let inner = self.inner.lock().await;
        MetricsResponse {
            destinations: inner.destinations.clone(),
            total_messages: inner.total_messages,
            deliveries: inner.deliveries,
            requeued: inner.requeued,
            queues: inner.queues,
            uptime_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the metrics HTTP server on the given port.
pub fn spawn_metrics_server(
    port: u16,
    collector: MetricsCollector,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/metrics", axum::routing::get(metrics_handler))
            .route("/health", axum::routing::get(|| async { "ok" }))
            .with_state(collector);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind metrics HTTP server");
                return;
            }
        };

        tracing::info!(port, "metrics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("metrics HTTP server stopped");
    })
}

async fn metrics_handler(
    axum::extract::State(collector): axum::extract::State<MetricsCollector>,
) -> axum::Json<MetricsResponse> {
    axum::Json(collector.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_accumulate_per_destination() {
        let c = MetricsCollector::new();
        c.record_send("OTDBService", 100).await;
        c.record_send("OTDBService", 50).await;
        c.record_send("otdb.notification", 10).await;
        c.record_unroutable("reply.gone").await;

        let snap = c.snapshot().await;
        assert_eq!(snap.total_messages, 3);
        assert_eq!(snap.destinations["OTDBService"].total_messages, 2);
        assert_eq!(snap.destinations["OTDBService"].total_bytes, 150);
        assert_eq!(snap.destinations["reply.gone"].unroutable, 1);
    }

    #[tokio::test]
    async fn snapshot_serializes_to_json() {
        let c = MetricsCollector::new();
        c.record_delivery().await;
        c.record_requeue().await;
        c.set_queue_count(4).await;

        let json = serde_json::to_value(c.snapshot().await).unwrap();
        assert_eq!(json["deliveries"], 1);
        assert_eq!(json["requeued"], 1);
        assert_eq!(json["queues"], 4);
    }
}
