//! TOML configuration for the server binary.
//!
//! Every field is serde-defaulted so a partial file — or no file at all —
//! still yields a runnable configuration.  Example:
//!
//! ```toml
//! [server]
//! name = "living-room"
//! log_level = "debug"
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 5000
//! discovery_port = 44444
//!
//! [heartbeat]
//! interval_secs = 60
//! liveness_timeout_secs = 120
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configured bind address is not a valid IP address.
    #[error("invalid bind address {addr:?}: {source}")]
    BindAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Name advertised in discovery replies.
    #[serde(default = "default_name")]
    pub name: String,
    /// Version string advertised in discovery replies.
    #[serde(default = "default_version")]
    pub version: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ports and bind address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port client sessions connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// UDP port the discovery responder answers on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Dispatcher workers per session.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

/// Heartbeat and liveness timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    /// Seconds between outbound pings.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds of peer silence before the session is torn down.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "Unknown Server".to_string()
}
fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_discovery_port() -> u16 {
    44444
}
fn default_worker_count() -> usize {
    2
}
fn default_interval_secs() -> u64 {
    60
}
fn default_liveness_timeout_secs() -> u64 {
    120
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            worker_count: default_worker_count(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

// ── Loading and derived values ────────────────────────────────────────────────

impl ServerConfig {
    /// Loads the configuration, returning `ServerConfig::default()` when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than
    /// "not found", and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parses the configured bind address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BindAddress`] when it is not a valid IP.
    pub fn bind_addr(&self) -> Result<IpAddr, ConfigError> {
        self.network
            .bind_address
            .parse()
            .map_err(|source| ConfigError::BindAddress {
                addr: self.network.bind_address.clone(),
                source,
            })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.liveness_timeout_secs)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
