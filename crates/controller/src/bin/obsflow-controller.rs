//! obsflow-controller: turns scheduled pipeline tasks into Slurm jobs.
//!
//! Listens for task status changes on the bus, submits a primary and a
//! companion job for every scheduled pipeline and cancels them again when
//! the task is aborted.
//!
//! # Usage
//!
//! ```bash
//! # Broker endpoint and settings from config/obsflow.toml
//! obsflow-controller
//!
//! # Remote broker, Slurm reached over ssh
//! OBSFLOW_SLURM_RUNNER=ssh OBSFLOW_SLURM_HOST=head01 \
//!     obsflow-controller --endpoint tcp://broker:6000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use obsflow_bus::{BusConfig, ZmqBus};
use obsflow_controller::{Controller, ControllerConfig, OtdbClient};
use obsflow_rpc::RpcClientCache;
use obsflow_scheduler::SlurmGateway;
use tokio::sync::Notify;

/// Submits and cancels Slurm jobs as pipeline tasks change state.
#[derive(Parser, Debug)]
#[command(name = "obsflow-controller", version, about)]
struct Cli {
    /// Path to obsflow.toml. Missing file means built-in defaults.
    #[arg(long, env = "OBSFLOW_CONFIG", default_value = "config/obsflow.toml")]
    config: PathBuf,

    /// Override `bus.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<(BusConfig, ControllerConfig)> {
        let (mut bus, controller) = if self.config.exists() {
            (
                BusConfig::from_file(&self.config)?,
                ControllerConfig::from_file(&self.config)?,
            )
        } else {
            tracing::info!(path = %self.config.display(), "config file not found, using defaults");
            (BusConfig::from_toml("")?, ControllerConfig::from_toml("")?)
        };
        if let Some(endpoint) = &self.endpoint {
            bus.bus.endpoint = endpoint.clone();
            bus.validate()?;
        }
        Ok((bus, controller))
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
    tracing::info!(?cli, "starting obsflow-controller");

    let (bus_config, config) = cli.load_config()?;
    let bus = ZmqBus::connect_with_timeout(&bus_config.transport()?, bus_config.command_timeout())
        .await?;
    bus.ping().await?;

    let rpc = RpcClientCache::new(Arc::new(bus.clone()))
        .with_services(&bus_config)
        .with_forward_exceptions(config.otdb.forward_exceptions);
    let otdb = OtdbClient::new(
        rpc,
        config.otdb.service.clone(),
        config.specification_timeout(),
        config.status_timeout(),
    );
    let scheduler = SlurmGateway::new(config.build_runner()?);
    let controller = Controller::new(otdb, scheduler, config.controller_settings());

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal.notify_one();
    });

    controller.run(&bus, shutdown).await?;

    tracing::info!("obsflow-controller exited cleanly");
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
