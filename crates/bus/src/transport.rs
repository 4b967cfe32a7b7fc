use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Directory that holds IPC socket files.
const IPC_DIR: &str = "/tmp/obsflow";

/// Where the bus broker listens and clients connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket under `/tmp/obsflow/<name>.sock`. Single-host only.
    Ipc(String),

    /// TCP endpoint for the distributed deployment.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// ZeroMQ endpoint string (`ipc://...` or `tcp://host:port`).
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc://{}", self.ipc_path(name).display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    fn ipc_path(&self, name: &str) -> PathBuf {
        Path::new(IPC_DIR).join(format!("{name}.sock"))
    }

    /// Parse an endpoint string like `ipc:///tmp/obsflow/bus.sock` or
    /// `tcp://host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, BusError> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            let name = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| BusError::Config(format!("bad ipc endpoint '{endpoint}'")))?;
            return Ok(Self::ipc(name));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| BusError::Config(format!("tcp endpoint '{endpoint}' has no port")))?;
            let port = port
                .parse()
                .map_err(|_| BusError::Config(format!("bad port in endpoint '{endpoint}'")))?;
            return Ok(Self::tcp(host, port));
        }
        Err(BusError::Config(format!(
            "unsupported endpoint '{endpoint}', expected ipc:// or tcp://"
        )))
    }

    /// For IPC transports, make sure the socket directory exists before bind.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(_) = self {
            std::fs::create_dir_all(IPC_DIR)?;
        }
        Ok(())
    }

    /// Remove a socket file left behind by a broker that did not shut down
    /// cleanly; otherwise the next bind fails with `EADDRINUSE`.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(name) = self {
            let path = self.ipc_path(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "removed stale IPC socket");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl FromStr for Transport {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
