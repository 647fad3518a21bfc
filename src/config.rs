//! Configuration file loading.
//!
//! The whole application is configured from one TOML file:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [dedup]
//! ttl = "1h"
//! sweep_interval = "30m"
//!
//! [mqtt]
//! keep_alive = "180s"
//! reconnect_period = "60s"
//!
//! [[connections]]
//! id = "plant-a"
//! token = "..."
//! endpoint = "wss://mqtt.daizy.io"
//! ```
//!
//! Every section is optional. A connection with an empty token is kept and
//! reported as unauthorized instead of being rejected.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::dedup::DedupConfig;
use crate::mqtt::config::{MqttConfig, MIN_KEEP_ALIVE};

const APP_DIR: &str = "bacnet-events";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub dedup: DedupConfig,
    pub mqtt: MqttConfig,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One broker link: a credential on an endpoint.
#[derive(Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Instance identifier, unique per configuration
    pub id: String,
    /// Credential; empty means unauthorized
    #[serde(default)]
    pub token: String,
    pub endpoint: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("id", &self.id)
            .field("token", &if self.token.is_empty() { "<empty>" } else { "<redacted>" })
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Config {
    /// `<config dir>/bacnet-events/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from {}", path.display());
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.dedup.ttl.is_zero() {
            return invalid("dedup.ttl must be greater than zero".to_string());
        }
        if self.dedup.sweep_interval.is_zero() {
            return invalid("dedup.sweep_interval must be greater than zero".to_string());
        }
        if self.mqtt.keep_alive < MIN_KEEP_ALIVE {
            return invalid("mqtt.keep_alive must be at least 1s".to_string());
        }
        if self.mqtt.reconnect_period.is_zero() {
            return invalid("mqtt.reconnect_period must be greater than zero".to_string());
        }
        if self.mqtt.channel_capacity == 0 {
            return invalid("mqtt.channel_capacity must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for connection in &self.connections {
            if connection.id.trim().is_empty() {
                return invalid("connection id must not be empty".to_string());
            }
            if connection.endpoint.trim().is_empty() {
                return invalid(format!(
                    "connection '{}' has no endpoint",
                    connection.id
                ));
            }
            if !seen.insert(connection.id.as_str()) {
                return invalid(format!("duplicate connection id '{}'", connection.id));
            }
        }

        Ok(())
    }
}
