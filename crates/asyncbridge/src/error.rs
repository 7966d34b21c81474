//! Host adapter errors.

use std::path::PathBuf;

use asyncbridge_broker::{BrokerError, DispatchError};
use asyncbridge_spec::{ParseError, ResolveError};
use asyncbridge_telemetry::TelemetryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("no AsyncAPI document found in {0}")]
    NoDocument(PathBuf),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}
