use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::model::{
    server_url, Action, Channel, ChannelParameter, Document, Message, Operation, PayloadSchema,
    Server,
};
use crate::structure::check_structure;

/// Resolve a JSON Reference like `#/components/schemas/User` from the document root.
///
/// Only local references (`#/...`) are supported. Returns `None` for external refs.
fn resolve_ref<'a>(root: &'a Value, ref_path: &str) -> Option<&'a Value> {
    let pointer = ref_path.strip_prefix("#/")?;
    let mut current = root;
    for segment in pointer.split('/') {
        current = current.get(unescape_pointer(segment))?;
    }
    Some(current)
}

fn unescape_pointer(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Recursively inline every `$ref` in `value`.
///
/// `visited` tracks the current resolution chain to detect circular references.
fn resolve_refs(
    value: &Value,
    root: &Value,
    visited: &mut HashSet<String>,
) -> Result<Value, ParseError> {
    match value {
        Value::Object(obj) => {
            if let Some(ref_str) = obj.get("$ref").and_then(|v| v.as_str()) {
                if !visited.insert(ref_str.to_string()) {
                    return Err(ParseError::SchemaInvalid(format!(
                        "circular $ref detected: {}",
                        ref_str
                    )));
                }
                let target = resolve_ref(root, ref_str)
                    .ok_or_else(|| ParseError::UnresolvedRef(ref_str.to_string()))?;
                let resolved = resolve_refs(target, root, visited)?;
                visited.remove(ref_str);
                Ok(resolved)
            } else {
                let mut new_obj = Map::with_capacity(obj.len());
                for (key, val) in obj {
                    new_obj.insert(key.clone(), resolve_refs(val, root, visited)?);
                }
                Ok(Value::Object(new_obj))
            }
        }
        Value::Array(arr) => {
            let items: Result<Vec<_>, _> = arr
                .iter()
                .map(|v| resolve_refs(v, root, visited))
                .collect();
            Ok(Value::Array(items?))
        }
        other => Ok(other.clone()),
    }
}

fn inline(value: &Value, root: &Value) -> Result<Value, ParseError> {
    resolve_refs(value, root, &mut HashSet::new())
}

/// Follow a top-level `$ref` chain without touching nested references.
///
/// Operations keep their `channel` reference intact this way.
fn follow_ref<'a>(value: &'a Value, root: &'a Value) -> Result<&'a Value, ParseError> {
    let mut current = value;
    let mut seen = HashSet::new();
    while let Some(ref_str) = current.get("$ref").and_then(|v| v.as_str()) {
        if !seen.insert(ref_str) {
            return Err(ParseError::SchemaInvalid(format!(
                "circular $ref detected: {}",
                ref_str
            )));
        }
        current =
            resolve_ref(root, ref_str).ok_or_else(|| ParseError::UnresolvedRef(ref_str.into()))?;
    }
    Ok(current)
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ParseError> {
    value
        .as_object()
        .ok_or_else(|| ParseError::SchemaInvalid(format!("{} must be an object", what)))
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Parse an AsyncAPI 3.x description from raw bytes (YAML or JSON).
///
/// Stateless: every call builds its own validator and retains nothing.
pub fn parse_document(input: &[u8]) -> Result<Document, ParseError> {
    let text = std::str::from_utf8(input)
        .map_err(|e| ParseError::MalformedInput(format!("input is not UTF-8: {}", e)))?;

    // JSON is valid YAML, so one parser covers both.
    let root: Value =
        serde_yaml::from_str(text).map_err(|e| ParseError::MalformedInput(e.to_string()))?;

    let root_obj = root
        .as_object()
        .ok_or_else(|| ParseError::SchemaInvalid("document root must be an object".into()))?;

    if let Some(version) = root_obj.get("asyncapi").and_then(|v| v.as_str()) {
        if !version.starts_with("3.") {
            return Err(ParseError::SchemaInvalid(format!(
                "unsupported AsyncAPI version: {} (only 3.x supported)",
                version
            )));
        }
    }

    check_structure(&root)?;

    let version = string_field(root_obj, "asyncapi").unwrap_or_default();
    let info = root_obj
        .get("info")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ParseError::SchemaInvalid("missing 'info' object".into()))?;
    let title = string_field(info, "title").unwrap_or_default();
    let api_version = string_field(info, "version").unwrap_or_default();
    let default_content_type = string_field(root_obj, "defaultContentType");

    let servers = parse_servers(root_obj, &root)?;
    let mut channels = parse_channels(root_obj, &root, default_content_type.as_deref())?;
    attach_operations(root_obj, &root, &mut channels)?;

    let document = Document {
        version,
        title,
        api_version,
        default_content_type,
        servers,
        channels: channels.into_iter().map(|(_, channel, _)| channel).collect(),
    };

    tracing::debug!(
        title = %document.title,
        servers = document.servers.len(),
        channels = document.channels.len(),
        "parsed AsyncAPI document"
    );

    Ok(document)
}

/// Parse a description from a file path.
pub fn parse_document_file(path: &std::path::Path) -> Result<Document, ParseError> {
    let content = std::fs::read(path)?;
    parse_document(&content)
}

fn parse_servers(root: &Map<String, Value>, spec_root: &Value) -> Result<Vec<Server>, ParseError> {
    let Some(servers) = root.get("servers").and_then(|v| v.as_object()) else {
        return Ok(Vec::new());
    };

    let mut result = Vec::with_capacity(servers.len());
    for (name, value) in servers {
        let resolved = inline(value, spec_root)?;
        let obj = as_object(&resolved, &format!("server '{}'", name))?;

        let host = string_field(obj, "host").ok_or_else(|| {
            ParseError::SchemaInvalid(format!("server '{}' missing 'host'", name))
        })?;
        let protocol = string_field(obj, "protocol").ok_or_else(|| {
            ParseError::SchemaInvalid(format!("server '{}' missing 'protocol'", name))
        })?;

        result.push(Server {
            name: name.clone(),
            url: server_url(&protocol, &host),
            host,
            protocol,
            protocol_version: string_field(obj, "protocolVersion"),
            pathname: string_field(obj, "pathname"),
            description: string_field(obj, "description"),
        });
    }
    Ok(result)
}

/// Channel key, the modelled channel, and its messages keyed for operation lookup.
type ChannelEntry = (String, Channel, Vec<Message>);

fn parse_channels(
    root: &Map<String, Value>,
    spec_root: &Value,
    default_content_type: Option<&str>,
) -> Result<Vec<ChannelEntry>, ParseError> {
    let Some(channels) = root.get("channels").and_then(|v| v.as_object()) else {
        return Ok(Vec::new());
    };

    let mut result = Vec::with_capacity(channels.len());
    for (name, value) in channels {
        let channel_value = follow_ref(value, spec_root)?;
        let obj = as_object(channel_value, &format!("channel '{}'", name))?;

        // A null or missing address means the key doubles as the address.
        let address = string_field(obj, "address").unwrap_or_else(|| name.clone());

        let messages = parse_channel_messages(name, obj, spec_root, default_content_type)?;
        let parameters = parse_channel_parameters(name, obj, spec_root)?;

        let channel = Channel {
            name: name.clone(),
            address,
            description: string_field(obj, "description"),
            parameters,
            operations: Vec::new(),
        };
        result.push((name.clone(), channel, messages));
    }
    Ok(result)
}

fn parse_channel_messages(
    channel: &str,
    obj: &Map<String, Value>,
    spec_root: &Value,
    default_content_type: Option<&str>,
) -> Result<Vec<Message>, ParseError> {
    let Some(messages) = obj.get("messages").and_then(|v| v.as_object()) else {
        return Ok(Vec::new());
    };

    let mut result = Vec::with_capacity(messages.len());
    for (name, value) in messages {
        let resolved = inline(value, spec_root)?;
        let msg = as_object(
            &resolved,
            &format!("message '{}' on channel '{}'", name, channel),
        )?;

        let payload = msg.get("payload").cloned();
        let payload_schema = payload
            .as_ref()
            .map(PayloadSchema::from_schema)
            .unwrap_or_default();

        result.push(Message {
            name: name.clone(),
            title: string_field(msg, "title"),
            summary: string_field(msg, "summary"),
            description: string_field(msg, "description"),
            content_type: string_field(msg, "contentType")
                .or_else(|| default_content_type.map(str::to_string)),
            payload,
            payload_schema,
        });
    }
    Ok(result)
}

fn parse_channel_parameters(
    channel: &str,
    obj: &Map<String, Value>,
    spec_root: &Value,
) -> Result<Vec<ChannelParameter>, ParseError> {
    let Some(params) = obj.get("parameters").and_then(|v| v.as_object()) else {
        return Ok(Vec::new());
    };

    let mut result = Vec::with_capacity(params.len());
    for (id, value) in params {
        let resolved = inline(value, spec_root)?;
        let param = as_object(
            &resolved,
            &format!("parameter '{}' on channel '{}'", id, channel),
        )?;

        let allowed = param
            .get("enum")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        result.push(ChannelParameter {
            id: id.clone(),
            description: string_field(param, "description"),
            default: string_field(param, "default"),
            allowed,
        });
    }
    Ok(result)
}

/// Attach every root-level operation to the channel its `$ref` names.
fn attach_operations(
    root: &Map<String, Value>,
    spec_root: &Value,
    channels: &mut [ChannelEntry],
) -> Result<(), ParseError> {
    let Some(ops) = root.get("operations").and_then(|v| v.as_object()) else {
        return Ok(());
    };

    let index: BTreeMap<String, usize> = channels
        .iter()
        .enumerate()
        .map(|(i, (key, _, _))| (key.clone(), i))
        .collect();

    for (op_id, value) in ops {
        let op_value = follow_ref(value, spec_root)?;
        let op = as_object(op_value, &format!("operation '{}'", op_id))?;

        let action_str = op.get("action").and_then(|v| v.as_str()).ok_or_else(|| {
            ParseError::SchemaInvalid(format!("operation '{}' missing 'action' field", op_id))
        })?;
        let action = Action::parse(action_str).ok_or_else(|| {
            ParseError::SchemaInvalid(format!(
                "operation '{}' has invalid action '{}' (must be 'send' or 'receive')",
                op_id, action_str
            ))
        })?;

        let channel_key = channel_ref_name(op_id, op)?;
        let position = *index.get(&channel_key).ok_or_else(|| {
            ParseError::SchemaInvalid(format!(
                "operation '{}' references undefined channel '{}'",
                op_id, channel_key
            ))
        })?;

        let (_, channel, channel_messages) = &mut channels[position];
        let messages = select_operation_messages(op_id, op, &channel_key, channel_messages)?;

        channel.operations.push(Operation {
            id: op_id.clone(),
            action,
            summary: string_field(op, "summary"),
            description: string_field(op, "description"),
            messages,
        });
    }
    Ok(())
}

/// Extract `<name>` from an operation's `channel: { $ref: '#/channels/<name>' }`.
fn channel_ref_name(op_id: &str, op: &Map<String, Value>) -> Result<String, ParseError> {
    let ref_str = op
        .get("channel")
        .and_then(|c| c.get("$ref"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ParseError::SchemaInvalid(format!(
                "operation '{}' channel must be a $ref to #/channels/...",
                op_id
            ))
        })?;

    let name = ref_str.strip_prefix("#/channels/").ok_or_else(|| {
        ParseError::SchemaInvalid(format!(
            "invalid channel $ref '{}' on operation '{}' (expected #/channels/...)",
            ref_str, op_id
        ))
    })?;
    Ok(unescape_pointer(name))
}

/// Pick the operation's messages out of its channel's messages.
///
/// No `messages` array means every channel message applies.
fn select_operation_messages(
    op_id: &str,
    op: &Map<String, Value>,
    channel_key: &str,
    channel_messages: &[Message],
) -> Result<Vec<Message>, ParseError> {
    let Some(refs) = op.get("messages").and_then(|v| v.as_array()) else {
        return Ok(channel_messages.to_vec());
    };

    let mut result = Vec::with_capacity(refs.len());
    for item in refs {
        let ref_str = item.get("$ref").and_then(|v| v.as_str()).ok_or_else(|| {
            ParseError::SchemaInvalid(format!(
                "operation '{}' messages must be $refs to its channel's messages",
                op_id
            ))
        })?;

        // Format: "#/channels/<channel>/messages/<message>"
        let parts: Vec<String> = ref_str
            .strip_prefix("#/")
            .unwrap_or(ref_str)
            .split('/')
            .map(unescape_pointer)
            .collect();
        let in_channel = parts.len() == 4
            && parts[0] == "channels"
            && parts[1] == channel_key
            && parts[2] == "messages";
        if !in_channel {
            return Err(ParseError::SchemaInvalid(format!(
                "operation '{}' message $ref '{}' does not point into channel '{}'",
                op_id, ref_str, channel_key
            )));
        }

        let message = channel_messages
            .iter()
            .find(|m| m.name == parts[3])
            .ok_or_else(|| {
                ParseError::SchemaInvalid(format!(
                    "operation '{}' references undefined message '{}'",
                    op_id, parts[3]
                ))
            })?;
        result.push(message.clone());
    }
    Ok(result)
}
