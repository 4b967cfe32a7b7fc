use thiserror::Error;

/// Errors that can occur in the obsflow messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("channel already closed: {0}")]
    Closed(String),

    #[error("broker rejected command: {0}")]
    Rejected(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
