//! Payload encoding by declared content type.

use bytes::Bytes;
use serde_json::Value;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Yaml,
    Text,
    /// Unknown content types; delivered as text.
    Opaque,
}

impl Codec {
    /// Pick a codec from a content type. No content type means JSON.
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::Json;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "" | "application/json" | "text/json" => Self::Json,
            "application/yaml" | "application/x-yaml" | "text/yaml" => Self::Yaml,
            e if e.ends_with("+json") => Self::Json,
            e if e.ends_with("+yaml") => Self::Yaml,
            e if e.starts_with("text/") => Self::Text,
            _ => Self::Opaque,
        }
    }
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    /// The bytes did not match the content type and were taken as text.
    pub fallback: bool,
}

pub fn decode(content_type: Option<&str>, payload: &[u8]) -> Decoded {
    let structured = match Codec::for_content_type(content_type) {
        Codec::Json => serde_json::from_slice::<Value>(payload).ok(),
        Codec::Yaml => serde_yaml::from_slice::<Value>(payload).ok(),
        Codec::Text | Codec::Opaque => {
            return match std::str::from_utf8(payload) {
                Ok(text) => Decoded {
                    value: Value::String(text.to_string()),
                    fallback: false,
                },
                Err(_) => as_text(payload),
            };
        }
    };

    match structured {
        Some(value) => Decoded {
            value,
            fallback: false,
        },
        None => as_text(payload),
    }
}

fn as_text(payload: &[u8]) -> Decoded {
    Decoded {
        value: Value::String(String::from_utf8_lossy(payload).into_owned()),
        fallback: true,
    }
}

/// Serialize an outbound payload. Strings are written raw for text types.
pub fn encode(content_type: Option<&str>, payload: &Value) -> Result<Bytes, DispatchError> {
    match (Codec::for_content_type(content_type), payload) {
        (Codec::Text | Codec::Opaque, Value::String(text)) => Ok(Bytes::from(text.clone())),
        (Codec::Yaml, value) => serde_yaml::to_string(value)
            .map(Bytes::from)
            .map_err(|e| DispatchError::Encode(e.to_string())),
        (_, value) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| DispatchError::Encode(e.to_string())),
    }
}
