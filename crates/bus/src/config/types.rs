use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Messaging part of `obsflow.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub bus: BusSection,

    /// Named RPC services, keyed by service name (e.g. `OTDBService`).
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Broker endpoint and the topology it declares at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// ROUTER endpoint, `ipc://…` or `tcp://host:port`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Topic exchanges declared at startup.
    #[serde(default)]
    pub exchanges: Vec<String>,

    /// Extra durable queues declared at startup. Service request queues are
    /// added automatically.
    #[serde(default)]
    pub queues: Vec<String>,

    /// Optional HTTP port for the broker's `/metrics` and `/health`.
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// How long a client waits for the broker to answer a command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Idle time after which the broker drops an ephemeral queue nobody is
    /// fetching from.
    #[serde(default = "default_ephemeral_idle_secs")]
    pub ephemeral_idle_secs: u64,
}

/// One request/reply service reachable over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Request queue; defaults to the service name.
    #[serde(default)]
    pub queue: Option<String>,

    /// Default reply timeout for calls to this service.
    #[serde(default = "default_service_timeout_secs")]
    pub timeout_secs: u64,
}

// ── Defaults ────────────────────────────────────────────────────────

fn default_endpoint() -> String {
    "ipc:///tmp/obsflow/bus.sock".into()
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_ephemeral_idle_secs() -> u64 {
    300
}

fn default_service_timeout_secs() -> u64 {
    10
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            exchanges: Vec::new(),
            queues: Vec::new(),
            metrics_port: None,
            command_timeout_secs: default_command_timeout_secs(),
            ephemeral_idle_secs: default_ephemeral_idle_secs(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue: None,
            timeout_secs: default_service_timeout_secs(),
        }
    }
}
