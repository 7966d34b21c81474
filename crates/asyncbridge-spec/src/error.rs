use thiserror::Error;

/// Errors produced while turning raw bytes into a [`Document`](crate::Document).
///
/// A failed parse never yields a partial document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The input is not parseable as YAML/JSON at all.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The input parsed, but does not describe a usable AsyncAPI 3.x document.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// A local `$ref` points at nothing.
    #[error("unresolved $ref: {0}")]
    UnresolvedRef(String),

    /// I/O error reading the description file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced when deriving a [`Binding`](crate::Binding) from a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),

    #[error("operation '{operation}' not found on channel '{channel}'")]
    OperationNotFound { channel: String, operation: String },

    #[error("document declares no servers")]
    NoServer,

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    #[error("message '{message}' not found on operation '{operation}'")]
    MessageNotFound { operation: String, message: String },
}
