//! Relay configuration.
//!
//! Read from an optional JSON file; any field left out keeps its default.
//! ```json
//! { "port": 8443, "flush_interval_ms": 50, "liveness_timeout_ms": 30000 }
//! ```

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// TCP port to listen on
    pub port: u16,
    /// Period of the global flush tick
    pub flush_interval_ms: u64,
    /// How often the liveness monitor sweeps
    pub liveness_check_interval_ms: u64,
    /// Inbound silence after which a participant is evicted
    pub liveness_timeout_ms: u64,
    /// Smallest flush period a client may ask for, in flush ticks
    pub min_period: u32,
    /// Accepted for compatibility; TLS is not terminated by the relay
    pub tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            flush_interval_ms: 50,
            liveness_check_interval_ms: 5_000,
            liveness_timeout_ms: 30_000,
            min_period: 1,
            tls: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    /// Like [`from_file`](Self::from_file), but a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match Self::from_file(path) {
            Err(RelayError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}
