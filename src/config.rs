// Configuration module - loads and validates the collector settings file
//
// This module is responsible for:
// 1. Reading the JSON settings file from disk
// 2. Deserializing connections, metric schedules and sink settings
// 3. Rejecting invalid values before any poller starts
// 4. Providing strongly-typed access to settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::metrics::MetricKind;

/// Settings file used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "configuration/ecs_pulse_config.json";

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file is not valid JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),

    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),
}

/// Main configuration structure loaded from the settings file
///
/// # Example
/// ```json
/// {
///   "logging_level": "info",
///   "temp_dir": "/var/tmp/ecs-pulse",
///   "connections": [
///     {
///       "protocol": "https",
///       "host": "ecs1.example.com",
///       "port": 4443,
///       "user": "monitor",
///       "password": "secret",
///       "vdc": "vdc1"
///     }
///   ],
///   "metrics": {
///     "LocalZone": { "interval": 60 },
///     "Capacity": { "interval": 300, "measurement": "EcsCapacity" }
///   },
///   "sink": {
///     "type": "influx",
///     "url": "http://localhost:8086",
///     "database": "ecs"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// One of `debug`, `info`, `warning`, `error`
    #[serde(default = "default_logging_level")]
    pub logging_level: String,

    /// Directory where billing payloads are staged before parsing
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// ECS endpoints to poll
    pub connections: Vec<ConnectionSettings>,

    /// Map of metric kind name to its schedule
    /// Key: Metric kind (e.g., "LocalZone", "Capacity")
    /// Value: Interval and optional measurement override
    pub metrics: BTreeMap<String, MetricSettings>,

    /// Where points are written
    pub sink: SinkSettings,
}

/// One ECS management endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// `http` or `https`
    pub protocol: String,

    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: String,

    /// Zone identity written as the `VDC` tag; the host is used when absent
    #[serde(default)]
    pub vdc: Option<String>,

    /// Seconds allowed to establish a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds allowed for a whole request
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    #[serde(default)]
    pub verify_tls: bool,
}

impl ConnectionSettings {
    /// Endpoint root, e.g. `https://ecs1.example.com:4443`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    #[cfg(test)]
    pub fn for_host(host: &str) -> Self {
        ConnectionSettings {
            protocol: "https".to_string(),
            host: host.to_string(),
            port: 4443,
            user: "monitor".to_string(),
            password: "secret".to_string(),
            vdc: None,
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            verify_tls: false,
        }
    }
}

// Keep the password out of logs
impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("vdc", &self.vdc)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Settings for an individual metric kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSettings {
    /// Polling interval in seconds, at least 1
    pub interval: u64,

    /// Measurement name override; defaults to the metric kind name
    #[serde(default)]
    pub measurement: Option<String>,
}

/// Point sink backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkSettings {
    /// InfluxDB 1.x HTTP API
    Influx {
        url: String,
        database: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },

    /// MongoDB, one collection per measurement
    Mongodb { uri: String, database: String },
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("ecs-pulse")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

impl Settings {
    /// Parses and validates settings from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Configured metric kinds with their schedules, in name order
    pub fn metric_kinds(&self) -> Result<Vec<(MetricKind, &MetricSettings)>, ConfigError> {
        self.metrics
            .iter()
            .map(|(name, metric)| {
                name.parse::<MetricKind>()
                    .map(|kind| (kind, metric))
                    .map_err(|e| ConfigError::InvalidSettings(e.to_string()))
            })
            .collect()
    }

    /// `tracing` filter directive for the configured logging level
    pub fn log_filter(&self) -> &'static str {
        match self.logging_level.to_ascii_lowercase().as_str() {
            "debug" => "debug",
            "warning" => "warn",
            "error" => "error",
            _ => "info",
        }
    }

    /// Rejects settings no poller could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.logging_level.to_ascii_lowercase().as_str(),
            "debug" | "info" | "warning" | "error"
        ) {
            return Err(ConfigError::InvalidSettings(format!(
                "logging_level '{}' must be one of debug, info, warning, error",
                self.logging_level
            )));
        }

        if self.connections.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("connections".to_string()));
        }
        for (index, connection) in self.connections.iter().enumerate() {
            validate_connection(index, connection)?;
        }

        if self.metrics.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("metrics".to_string()));
        }
        for (kind, metric) in self.metric_kinds()? {
            if metric.interval == 0 {
                return Err(ConfigError::InvalidSettings(format!(
                    "{}: interval must be at least 1 second",
                    kind
                )));
            }
            if metric.measurement.as_deref().map_or(false, str::is_empty) {
                return Err(ConfigError::InvalidSettings(format!(
                    "{}: measurement must not be empty",
                    kind
                )));
            }
        }

        match &self.sink {
            SinkSettings::Influx { url, database, .. } => {
                require("sink.url", url)?;
                require("sink.database", database)?;
            }
            SinkSettings::Mongodb { uri, database } => {
                require("sink.uri", uri)?;
                require("sink.database", database)?;
            }
        }

        Ok(())
    }

    /// Logs each connection and metric schedule for visibility
    pub fn log_summary(&self) {
        info!(
            "Loaded settings with {} connection(s) and {} metric kind(s)",
            self.connections.len(),
            self.metrics.len()
        );

        for connection in &self.connections {
            info!(
                "  Connection {} as '{}' (VDC: {})",
                connection.base_url(),
                connection.user,
                connection.vdc.as_deref().unwrap_or(&connection.host)
            );
        }

        for (metric_name, metric_config) in &self.metrics {
            info!(
                "  {} - Measurement: '{}', Interval: {}s",
                metric_name,
                metric_config.measurement.as_deref().unwrap_or(metric_name),
                metric_config.interval
            );
        }
    }
}

fn validate_connection(index: usize, connection: &ConnectionSettings) -> Result<(), ConfigError> {
    let field = |name: &str| format!("connections[{}].{}", index, name);

    require(&field("protocol"), &connection.protocol)?;
    require(&field("host"), &connection.host)?;
    require(&field("user"), &connection.user)?;
    require(&field("password"), &connection.password)?;

    if !matches!(connection.protocol.as_str(), "http" | "https") {
        return Err(ConfigError::InvalidSettings(format!(
            "{} must be http or https, got '{}'",
            field("protocol"),
            connection.protocol
        )));
    }
    if connection.port == 0 {
        return Err(ConfigError::InvalidSettings(format!(
            "{} must be non-zero",
            field("port")
        )));
    }
    if connection.connect_timeout == 0 || connection.read_timeout == 0 {
        return Err(ConfigError::InvalidSettings(format!(
            "{}: timeouts must be at least 1 second",
            field("host")
        )));
    }

    Ok(())
}

fn require(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingRequiredSetting(name.to_string()))
    } else {
        Ok(())
    }
}

/// Loads settings from a JSON file
///
/// Called once at startup. Any error here ends the process.
///
/// # Arguments
/// * `path` - Settings file path (e.g., "configuration/ecs_pulse_config.json")
///
/// # Returns
/// * `Ok(Settings)` - Successfully loaded and validated settings
/// * `Err(ConfigError)` - File unreadable, malformed or invalid
pub async fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;

    Settings::from_json(&text)
}
