//! Resolution of a (channel, operation) pair into a connectable binding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::model::{Action, Document, Message, PayloadSchema};

/// Everything needed to connect, subscribe or publish for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    /// `protocol://host`, or the configured override.
    pub server_url: String,
    pub protocol: String,
    /// Broker topic. Unresolved `{param}` placeholders pass through verbatim.
    pub topic: String,
    pub channel_address: String,
    pub operation_id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub payload_schema: PayloadSchema,
    /// Subscribe on the binding's topic before the first publish.
    #[serde(default)]
    pub subscribe_before_publish: bool,
}

impl Binding {
    pub fn is_send(&self) -> bool {
        self.action == Action::Send
    }

    pub fn is_receive(&self) -> bool {
        self.action == Action::Receive
    }
}

/// Host-side selection of what to bind to.
///
/// Only `channel` and `operation` are required; every other field overrides
/// what the document would otherwise imply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selection {
    pub channel: String,
    pub operation: String,
    /// Server key under `servers`; the first server when absent.
    pub server: Option<String>,
    /// Replaces the server URL entirely.
    pub server_url: Option<String>,
    /// Replaces the channel address as the topic.
    pub topic: Option<String>,
    /// Message name; the operation's first message when absent.
    pub message: Option<String>,
    pub subscribe_before_publish: bool,
    /// Values for `{param}` placeholders in the channel address.
    pub parameters: BTreeMap<String, String>,
}

impl Selection {
    pub fn new(channel: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }
}

/// Resolve a channel address and operation id with no overrides.
pub fn resolve(doc: &Document, channel: &str, operation: &str) -> Result<Binding, ResolveError> {
    resolve_selection(doc, &Selection::new(channel, operation))
}

/// Resolve a full selection against a parsed document.
pub fn resolve_selection(doc: &Document, selection: &Selection) -> Result<Binding, ResolveError> {
    let channel = doc
        .channel(&selection.channel)
        .ok_or_else(|| ResolveError::ChannelNotFound(selection.channel.clone()))?;

    let operation =
        channel
            .operation(&selection.operation)
            .ok_or_else(|| ResolveError::OperationNotFound {
                channel: selection.channel.clone(),
                operation: selection.operation.clone(),
            })?;

    let (server_url, protocol) = match (&selection.server_url, &selection.server) {
        (Some(url), _) => (url.clone(), protocol_of(url)),
        (None, Some(name)) => {
            let server = doc
                .server(name)
                .ok_or_else(|| ResolveError::ServerNotFound(name.clone()))?;
            (server.url.clone(), server.protocol.clone())
        }
        (None, None) => {
            let server = doc.servers.first().ok_or(ResolveError::NoServer)?;
            (server.url.clone(), server.protocol.clone())
        }
    };

    let message = select_message(&operation.id, &operation.messages, selection)?;

    let topic = match &selection.topic {
        Some(topic) => topic.clone(),
        None => substitute_parameters(&channel.address, &selection.parameters),
    };

    Ok(Binding {
        server_url,
        protocol,
        topic,
        channel_address: channel.address.clone(),
        operation_id: operation.id.clone(),
        action: operation.action,
        content_type: message
            .and_then(|m| m.content_type.clone())
            .or_else(|| doc.default_content_type.clone()),
        payload_schema: message
            .map(|m| m.payload_schema.clone())
            .unwrap_or_default(),
        subscribe_before_publish: selection.subscribe_before_publish,
    })
}

fn select_message<'a>(
    operation: &str,
    messages: &'a [Message],
    selection: &Selection,
) -> Result<Option<&'a Message>, ResolveError> {
    match &selection.message {
        Some(name) => messages
            .iter()
            .find(|m| &m.name == name)
            .map(Some)
            .ok_or_else(|| ResolveError::MessageNotFound {
                operation: operation.to_string(),
                message: name.clone(),
            }),
        None => Ok(messages.first()),
    }
}

/// Scheme of a URL, or the whole string if it has none.
fn protocol_of(url: &str) -> String {
    url.split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or(url)
        .to_string()
}

/// Replace `{name}` with a supplied value; unknown placeholders stay as written.
fn substitute_parameters(address: &str, values: &BTreeMap<String, String>) -> String {
    if values.is_empty() {
        return address.to_string();
    }

    let mut out = String::with_capacity(address.len());
    let mut rest = address;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
