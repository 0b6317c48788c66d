use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Default onion-routing listen port
    pub const DEFAULT_OR_PORT: u16 = 9001;

    /// Capacity of each circuit's per-leg inbound cell queue
    pub const CELL_QUEUE_CAPACITY: usize = 16;

    /// How long to wait for the next hop to answer a CREATE(2)
    pub const EXTEND_TIMEOUT_SECS: u64 = 30;

    /// Outbound dial timeout
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
}

/// Relay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub listen_port: u16,

    /// Capacity of per-circuit inbound cell queues
    pub cell_queue_capacity: usize,

    /// Seconds to wait for a CREATED(2) while extending a circuit
    pub extend_timeout_secs: u64,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_OR_PORT,
            cell_queue_capacity: protocol::CELL_QUEUE_CAPACITY,
            extend_timeout_secs: protocol::EXTEND_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_extend_timeout(mut self, secs: u64) -> Self {
        self.extend_timeout_secs = secs;
        self
    }

    pub fn extend_timeout(&self) -> Duration {
        Duration::from_secs(self.extend_timeout_secs)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
