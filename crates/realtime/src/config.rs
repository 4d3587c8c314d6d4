//! Connection manager configuration.
//!
//! Stored as TOML, every field optional:
//! - Linux: `~/.config/serverwatch/monitor.toml`
//! - Windows: `%APPDATA%/serverwatch/monitor.toml`
//!
//! ```toml
//! heartbeat_interval_ms = 30000
//! connect_timeout_ms = 10000
//!
//! [endpoint]
//! origin = "https://dashboard.example.com"
//!
//! [reconnect]
//! base_delay_ms = 3000
//! max_attempts = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use serverwatch_protocol::constants::{
    CONNECT_TIMEOUT, FRONTEND_WS_PATH, HEARTBEAT_INTERVAL, WS_MAX_MESSAGE_SIZE,
};

use crate::types::ReconnectConfig;

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the realtime endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Origin of the hosting dashboard. The WebSocket scheme mirrors it:
    /// `http` → `ws`, `https` → `wss`.
    pub origin: String,
    /// Endpoint path on the origin.
    pub path: String,
    /// Explicit `ws://` or `wss://` URL used instead of the origin.
    pub override_url: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:3000".into(),
            path: FRONTEND_WS_PATH.into(),
            override_url: None,
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub endpoint: EndpointConfig,

    /// Interval between heartbeat pings while open.
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,

    /// Time allowed for an attempt to open before it is aborted.
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    pub reconnect: ReconnectConfig,

    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

impl ManagerConfig {
    /// Loads configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Returns the platform-specific configuration file path.
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            let appdata =
                std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
            PathBuf::from(appdata)
                .join("serverwatch")
                .join("monitor.toml")
        }

        #[cfg(not(target_os = "windows"))]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(home)
                .join(".config")
                .join("serverwatch")
                .join("monitor.toml")
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Serializes a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
