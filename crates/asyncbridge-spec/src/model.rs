use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed AsyncAPI 3.x description.
///
/// Immutable once built; a new upload is reparsed wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The `asyncapi` version string (e.g. "3.0.0").
    pub version: String,
    /// The `info.title` field.
    pub title: String,
    /// The `info.version` field.
    pub api_version: String,
    /// Root `defaultContentType`, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_content_type: Option<String>,
    /// Servers in document order.
    pub servers: Vec<Server>,
    /// Channels in document order, each owning its operations.
    pub channels: Vec<Channel>,
}

impl Document {
    /// Find a channel by address, falling back to the channel key.
    pub fn channel(&self, address: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.address == address)
            .or_else(|| self.channels.iter().find(|c| c.name == address))
    }

    /// Find a server by its key in the `servers` map.
    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Iterate over every operation with its owning channel.
    pub fn operations(&self) -> impl Iterator<Item = (&Channel, &Operation)> {
        self.channels
            .iter()
            .flat_map(|c| c.operations.iter().map(move |op| (c, op)))
    }
}

/// A broker endpoint declared under `servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub name: String,
    pub host: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `protocol://host`.
    pub url: String,
}

/// Build `protocol://host` literally. No DNS resolution happens here.
pub(crate) fn server_url(protocol: &str, host: &str) -> String {
    format!("{}://{}", protocol, host)
}

/// An addressable topic within the description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// The key under `channels`.
    pub name: String,
    /// The broker address; defaults to the key when `address` is absent.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Vec<ChannelParameter>,
    pub operations: Vec<Operation>,
}

impl Channel {
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }
}

/// A `{param}` placeholder declared on a channel address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelParameter {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

/// Direction of an operation relative to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Application → broker (publish).
    Send,
    /// Broker → application (subscribe).
    Receive,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Self::Send),
            "receive" => Some(Self::Receive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directional action bound to exactly one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<Message>,
}

/// A message an operation may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared content type, or the document's `defaultContentType`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// The payload schema with all local `$ref`s inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Flattened top-level properties of an object payload.
    pub payload_schema: PayloadSchema,
}

/// One declared top-level property of an object payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    pub name: String,
    /// JSON Schema `type` keyword, if it is a single string.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Ordered list of top-level payload fields.
///
/// Nested and array schemas flatten to an empty list; validation skips them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadSchema(pub Vec<SchemaField>);

impl PayloadSchema {
    /// Flatten an object schema's `properties` in declaration order.
    pub fn from_schema(schema: &Value) -> Self {
        let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
            return Self::default();
        };
        if let Some(ty) = schema.get("type").and_then(|v| v.as_str()) {
            if ty != "object" {
                return Self::default();
            }
        }

        let fields = properties
            .iter()
            .map(|(name, prop)| SchemaField {
                name: name.clone(),
                field_type: prop.get("type").and_then(|v| v.as_str()).map(str::to_string),
                description: prop
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
            .collect();
        Self(fields)
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
