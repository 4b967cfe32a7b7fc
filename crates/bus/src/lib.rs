pub mod address;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod traits;
pub mod transport;

pub use address::Address;
pub use broker::{BrokerConfig, BusBroker};
pub use client::ZmqBus;
pub use config::{BusConfig, BusSection, ServiceConfig};
pub use error::BusError;
pub use memory::{BusStats, MemoryBus};
pub use message::Message;
pub use metrics::MetricsCollector;
pub use traits::{Bus, Inbound, InboundOptions, Outbound};
pub use transport::Transport;
