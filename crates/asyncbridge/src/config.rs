//! Bridge configuration (`bridge.toml`).
//!
//! ```toml
//! [document]
//! path = "specs/sensor.yaml"
//!
//! [selection]
//! channel = "sensors/{sensorId}/temperature"
//! operation = "receiveTemperature"
//! server_url = "mqtt://localhost:1883"
//!
//! [selection.parameters]
//! sensorId = "kitchen"
//!
//! [connection]
//! client_id = "bridge-1"
//!
//! [telemetry]
//! log_level = "debug"
//! log_format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use asyncbridge_broker::{ConnectOptions, ConnectionSettings};
use asyncbridge_spec::Selection;
use asyncbridge_telemetry::{LogFormat, TelemetryConfig};
use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub document: DocumentConfig,
    pub selection: Selection,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentConfig {
    /// A description file, or a directory whose first file by name is used.
    /// Relative paths are resolved against the config file's directory.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub client_id: String,
    pub connect_timeout_ms: u64,
    pub reconnect_period_ms: u64,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: "asyncbridge".to_string(),
            connect_timeout_ms: 5000,
            reconnect_period_ms: 2000,
            keep_alive_secs: 30,
            username: None,
            password: None,
        }
    }
}

impl ConnectionConfig {
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            options: ConnectOptions {
                client_id: self.client_id.clone(),
                keep_alive: Duration::from_secs(self.keep_alive_secs),
                username: self.username.clone(),
                password: self.password.clone(),
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_period: Duration::from_millis(self.reconnect_period_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl TelemetrySection {
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig::new()
            .with_log_level(self.log_level.clone())
            .with_log_format(self.log_format)
    }
}

impl BridgeConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content).map_err(|message| BridgeError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        })?;

        if config.document.path.is_relative() {
            if let Some(base) = path.parent() {
                config.document.path = base.join(&config.document.path);
            }
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        if config.selection.channel.is_empty() {
            return Err("selection.channel is required".to_string());
        }
        if config.selection.operation.is_empty() {
            return Err("selection.operation is required".to_string());
        }
        Ok(config)
    }
}
