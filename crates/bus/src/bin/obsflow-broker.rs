//! obsflow-broker: central queue/exchange broker for the obsflow bus.
//!
//! Serves `ZmqBus` clients over one ROUTER socket and optionally exposes
//! `/metrics` and `/health` over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC (default), topology from config/obsflow.toml if present
//! obsflow-broker
//!
//! # TCP on a custom endpoint
//! obsflow-broker --endpoint tcp://0.0.0.0:6000 --metrics-port 6001
//!
//! # Via environment variables
//! OBSFLOW_BUS_ENDPOINT=tcp://0.0.0.0:6000 obsflow-broker
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use obsflow_bus::{BusBroker, BusConfig};

/// Central queue/exchange broker for the obsflow bus.
#[derive(Parser, Debug)]
#[command(name = "obsflow-broker", version, about)]
struct Cli {
    /// Path to obsflow.toml. Missing file means built-in defaults.
    #[arg(long, env = "OBSFLOW_CONFIG", default_value = "config/obsflow.toml")]
    config: PathBuf,

    /// Override `bus.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,

    /// Extra exchanges to declare, on top of the config file.
    #[arg(long = "exchange")]
    exchanges: Vec<String>,

    /// Extra durable queues to declare, on top of the config file.
    #[arg(long = "queue")]
    queues: Vec<String>,

    /// HTTP port for `/metrics` (0 = disabled).
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Interval in seconds between metrics log lines (0 = disabled).
    #[arg(long, env = "OBSFLOW_METRICS_INTERVAL", default_value_t = 30)]
    metrics_interval: u64,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<BusConfig> {
        let mut config = if self.config.exists() {
            BusConfig::from_file(&self.config)?
        } else {
            tracing::info!(path = %self.config.display(), "config file not found, using defaults");
            BusConfig::from_toml("")?
        };
        if let Some(endpoint) = &self.endpoint {
            config.bus.endpoint = endpoint.clone();
        }
        config.bus.exchanges.extend(self.exchanges.iter().cloned());
        config.bus.queues.extend(self.queues.iter().cloned());
        match self.metrics_port {
            Some(0) => config.bus.metrics_port = None,
            Some(port) => config.bus.metrics_port = Some(port),
            None => {}
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting obsflow-broker");

    let config = cli.load_config()?.broker_config()?;
    let broker = Arc::new(BusBroker::new(config));

    let broker_for_signal = broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        broker_for_signal.shutdown();
    });

    if cli.metrics_interval > 0 {
        let collector = broker.collector().clone();
        let secs = cli.metrics_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let snap = collector.snapshot().await;
                tracing::info!(
                    total_messages = snap.total_messages,
                    deliveries = snap.deliveries,
                    requeued = snap.requeued,
                    queues = snap.queues,
                    "broker metrics"
                );
                for (destination, stats) in &snap.destinations {
                    tracing::debug!(
                        destination = %destination,
                        messages = stats.total_messages,
                        unroutable = stats.unroutable,
                        "destination stats"
                    );
                }
            }
        });
    }

    broker.run().await?;

    tracing::info!("obsflow-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
