//! AsyncAPI 3.x document parser and binding resolver.
//!
//! Reads YAML/JSON descriptions, checks their skeleton, inlines local `$ref`s
//! and resolves a (channel, operation) selection into a [`Binding`] that the
//! broker layer can connect with.

pub mod binding;
pub mod error;
pub mod model;
pub mod parser;
pub mod structure;

pub use binding::{resolve, resolve_selection, Binding, Selection};
pub use error::{ParseError, ResolveError};
pub use model::{
    Action, Channel, ChannelParameter, Document, Message, Operation, PayloadSchema, SchemaField,
    Server,
};
pub use parser::{parse_document, parse_document_file};
