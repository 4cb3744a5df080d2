// SPDX-License-Identifier: Apache-2.0

//! Engine configuration
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables. Every field has a default so an empty file (or no file) is a
//! valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::engine::error::{EngineError, EngineResult};

pub const DEFAULT_PORT: u16 = 52000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

const ENV_HOST: &str = "SQLBRIDGE_HOST";
const ENV_PORT: &str = "SQLBRIDGE_PORT";
const ENV_SERVER_BIN: &str = "SQLBRIDGE_SERVER_BIN";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Host the query server listens on
    pub host: String,
    /// Port the query server listens on (also passed to a spawned server)
    pub port: u16,
    /// Interval between two read attempts while a request is in flight
    pub poll_interval_ms: u64,
    /// Upper bound for opening the TCP session
    pub connect_timeout_ms: u64,
    /// Give up on a request after this long without its terminator frame.
    /// `None` polls indefinitely.
    pub request_timeout_ms: Option<u64>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// The engine's own log, written by [`crate::observability::init_tracing`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Defaults to [`crate::observability::log_directory`]
    pub directory: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: String,
    /// Rotated files older than this many days are removed at startup
    pub retention_days: u64,
}

/// Settings for the out-of-process query server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether the engine discovers/spawns the server itself
    pub manage: bool,
    /// Server executable; required only when a server has to be spawned
    pub binary_path: Option<PathBuf>,
    /// File receiving the spawned server's stdout and stderr
    pub log_path: PathBuf,
    /// OS utility used for port-to-process lookup
    pub discovery_tool: String,
    /// How long to wait for a freshly spawned server to accept connections
    pub startup_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            connect_timeout_ms: 5_000,
            request_timeout_ms: None,
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            filter: "sqlbridge=info".to_string(),
            retention_days: 14,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            manage: false,
            binary_path: None,
            log_path: crate::observability::log_directory().join("server.log"),
            discovery_tool: "lsof".to_string(),
            startup_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist, then applies environment overrides.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                EngineError::configuration(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
                EngineError::configuration(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            info!("Loaded engine configuration from {:?}", path);
            config
        } else {
            debug!("No engine config file at {:?}, using defaults", path);
            EngineConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_default();
        path.push("sqlbridge");
        path.push("config.json");
        path
    }

    fn apply_env_overrides(&mut self) -> EngineResult<()> {
        if let Ok(host) = std::env::var(ENV_HOST) {
            self.host = host;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            self.port = port.trim().parse().map_err(|_| {
                EngineError::configuration(format!("{ENV_PORT} is not a valid port: {port}"))
            })?;
        }
        if let Ok(bin) = std::env::var(ENV_SERVER_BIN) {
            self.server.binary_path = Some(PathBuf::from(bin));
        }
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::configuration("host must not be empty"));
        }
        if self.port == 0 {
            return Err(EngineError::configuration("port must not be 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(EngineError::configuration("poll_interval_ms must be positive"));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(EngineError::configuration(
                "request_timeout_ms must be positive when set",
            ));
        }
        if self.server.discovery_tool.trim().is_empty() {
            return Err(EngineError::configuration("server.discovery_tool must not be empty"));
        }
        self.logging.env_filter()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl LoggingConfig {
    /// Parses the configured directive, ignoring `RUST_LOG`.
    pub fn env_filter(&self) -> EngineResult<EnvFilter> {
        EnvFilter::try_new(&self.filter).map_err(|e| {
            EngineError::configuration(format!("Invalid log filter {:?}: {}", self.filter, e))
        })
    }

    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(crate::observability::log_directory)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}
