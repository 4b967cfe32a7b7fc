use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::broker::BrokerConfig;
use crate::error::BusError;
use crate::transport::Transport;

use super::types::{BusConfig, BusSection};

impl BusConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, BusError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-host deployment over an IPC socket.
    pub fn local() -> Self {
        Self {
            bus: BusSection::default(),
            services: HashMap::new(),
        }
    }

    /// Broker reachable over TCP; metrics one port above the bus.
    pub fn distributed(host: &str, port: u16) -> Self {
        Self {
            bus: BusSection {
                endpoint: format!("tcp://{host}:{port}"),
                metrics_port: Some(port + 1),
                ..BusSection::default()
            },
            services: HashMap::new(),
        }
    }

    pub fn transport(&self) -> Result<Transport, BusError> {
        Transport::parse(&self.bus.endpoint)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.bus.command_timeout_secs)
    }

    /// Request queue of a service. Unconfigured services use their own name.
    pub fn service_queue(&self, name: &str) -> String {
        self.services
            .get(name)
            .and_then(|svc| svc.queue.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Configured reply timeout of a service, if any.
    pub fn service_timeout(&self, name: &str) -> Option<Duration> {
        self.services
            .get(name)
            .map(|svc| Duration::from_secs(svc.timeout_secs))
    }

    /// Broker settings: configured queues plus every service request queue.
    pub fn broker_config(&self) -> Result<BrokerConfig, BusError> {
        let mut queues = self.bus.queues.clone();
        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();
        for name in names {
            let queue = self.service_queue(name);
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        Ok(BrokerConfig {
            endpoint: self.transport()?,
            exchanges: self.bus.exchanges.clone(),
            queues,
            metrics_port: self.bus.metrics_port,
            ephemeral_idle_timeout: Duration::from_secs(self.bus.ephemeral_idle_secs),
        })
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `OBSFLOW_SECTION_KEY` overrides `section.key`:
    /// - `OBSFLOW_BUS_ENDPOINT` -> `bus.endpoint`
    /// - `OBSFLOW_BUS_METRICS_PORT` -> `bus.metrics_port`
    /// - `OBSFLOW_BUS_COMMAND_TIMEOUT_SECS` -> `bus.command_timeout_secs`
    /// - `OBSFLOW_BUS_EPHEMERAL_IDLE_SECS` -> `bus.ephemeral_idle_secs`
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("OBSFLOW_BUS_ENDPOINT") {
            self.bus.endpoint = v;
        }
        if let Some(port) = lookup("OBSFLOW_BUS_METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.bus.metrics_port = Some(port);
        }
        if let Some(secs) = lookup("OBSFLOW_BUS_COMMAND_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.bus.command_timeout_secs = secs;
        }
        if let Some(secs) = lookup("OBSFLOW_BUS_EPHEMERAL_IDLE_SECS").and_then(|v| v.parse().ok()) {
            self.bus.ephemeral_idle_secs = secs;
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::local()
    }
}
