use thiserror::Error;

use asyncbridge_spec::Action;
use asyncbridge_validator::PayloadError;

/// Errors reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid broker URL '{0}'")]
    InvalidUrl(String),

    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("connection closed")]
    Closed,
}

/// Errors from a single dispatch attempt. None of them change connection state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("operation '{operation}' is a {action} operation")]
    WrongAction { operation: String, action: Action },

    #[error("not connected")]
    NotConnected,

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The binding has been torn down.
    #[error("binding closed")]
    Closed,
}
