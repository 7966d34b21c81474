//! asyncbridge host adapter.
//!
//! Wires a TOML configuration, an AsyncAPI description and a broker
//! connection into a [`BridgeNode`]. The `asyncbridge` binary is a thin
//! command-line host around it.

pub mod config;
pub mod error;
pub mod node;
pub mod source;

pub use config::{BridgeConfig, ConnectionConfig, DocumentConfig, TelemetrySection};
pub use error::BridgeError;
pub use node::BridgeNode;
pub use source::{load_document, locate_document};
