//! Structured logging with JSON output.
//!
//! JSON lines by default, one event per line, so a supervisor can ingest them.

use crate::{LogFormat, LogWriter, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber for `config`.
///
/// `RUST_LOG` overrides `config.log_level` when set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match (config.log_format, config.log_writer) {
        (LogFormat::Json, LogWriter::Stdout) => init_json_logging(filter, std::io::stdout),
        (LogFormat::Json, LogWriter::Stderr) => init_json_logging(filter, std::io::stderr),
        (LogFormat::Pretty, LogWriter::Stdout) => init_pretty_logging(filter, std::io::stdout),
        (LogFormat::Pretty, LogWriter::Stderr) => init_pretty_logging(filter, std::io::stderr),
    }
}

fn init_json_logging<W>(filter: EnvFilter, writer: W) -> Result<(), TelemetryError>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let json_layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

fn init_pretty_logging<W>(filter: EnvFilter, writer: W) -> Result<(), TelemetryError>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let pretty_layer = fmt::layer()
        .pretty()
        .with_writer(writer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
pub mod events {
    /// Process is starting up.
    pub const STARTUP: &str = "startup";

    /// Process is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// An AsyncAPI description has been parsed.
    pub const DOCUMENT_LOADED: &str = "document_loaded";

    /// A channel/operation selection resolved to a binding.
    pub const BINDING_RESOLVED: &str = "binding_resolved";

    /// A connection changed state.
    pub const CONNECTION_STATE: &str = "connection_state";

    /// A payload failed schema validation.
    pub const VALIDATION_FAILURE: &str = "validation_failure";

    /// Publish or subscribe failed.
    pub const DISPATCH_ERROR: &str = "dispatch_error";

    /// A broker message was emitted to the output sink.
    pub const MESSAGE_FORWARDED: &str = "message_forwarded";
}

/// `tracing` wrappers that tag each line with its `event` name.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_document_loaded {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::DOCUMENT_LOADED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_binding_resolved {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::BINDING_RESOLVED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_connection_state {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::CONNECTION_STATE,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_validation_failure {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::VALIDATION_FAILURE,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_dispatch_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::DISPATCH_ERROR,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_message_forwarded {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::MESSAGE_FORWARDED,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // Subscriber initialisation is process-global, so only parsing is tested here.

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("PRETTY"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("invalid"), None);
    }

    #[test]
    fn event_names_are_snake_case() {
        for name in [
            events::STARTUP,
            events::SHUTDOWN,
            events::DOCUMENT_LOADED,
            events::BINDING_RESOLVED,
            events::CONNECTION_STATE,
            events::VALIDATION_FAILURE,
            events::DISPATCH_ERROR,
            events::MESSAGE_FORWARDED,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
