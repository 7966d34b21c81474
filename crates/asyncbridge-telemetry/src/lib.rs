//! Observability for asyncbridge.
//!
//! Structured logging (JSON or pretty) and the standard event names the
//! binding engine logs with.
//!
//! # Usage
//!
//! ```ignore
//! use asyncbridge_telemetry::{Telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new().with_log_level("debug");
//! let telemetry = Telemetry::init(config)?;
//! ```

pub mod config;
pub mod logging;

pub use config::{LogFormat, LogWriter, TelemetryConfig};
pub use logging::events;

use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Main telemetry handle.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Initialize logging with the given configuration.
    ///
    /// A second call in the same process fails with [`TelemetryError::LoggingInit`].
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        crate::log_startup!(service = %config.service_name, version = env!("CARGO_PKG_VERSION"));
        Ok(Self { config })
    }

    /// Log the shutdown event.
    pub fn shutdown(&self) {
        crate::log_shutdown!(service = %self.config.service_name);
    }

    /// Get the telemetry configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}
