//! Application configuration loaded from a TOML file.
//!
//! ```toml
//! [mqtt]
//! host = "localhost"
//! port = 1883
//! qos = 1
//!
//! [bridge]
//! topic = "test"
//! completion_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Only `[mqtt].host` and `[mqtt].port` are required, every other key has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, Level};

use crate::mqtt::config::{validate_topic_filter, BridgeOptions, BrokerSettings};

const APP_DIR: &str = "inbound-bridge";
const CONFIG_FILE: &str = "config.toml";

fn default_topic() -> String {
    "test".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            thread_ids: true,
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.level.trim())
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.level)))
    }
}

/// The `[bridge]` section: which topic to subscribe to and how.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Topic filter handed to `InboundBridge::start`
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(flatten)]
    pub options: BridgeOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            options: BridgeOptions::default(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_filter(&self.topic)
            .map_err(|reason| ConfigError::Invalid(format!("bridge.topic: {}", reason)))?;
        self.options.validate()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    pub mqtt: BrokerSettings,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// `<config_dir>/inbound-bridge/config.toml`, `None` if the platform has no config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.bridge.validate()?;
        self.logging.level()?;
        Ok(())
    }
}
