//! Structural validation of the raw description before it is modelled.
//!
//! The embedded schema only checks the skeleton the binding engine relies on;
//! it is not a full AsyncAPI meta-schema.

use serde_json::{json, Value};

use crate::error::ParseError;

fn structural_schema() -> Value {
    json!({
        "type": "object",
        "required": ["asyncapi", "info", "servers", "channels", "operations"],
        "properties": {
            "asyncapi": { "type": "string" },
            "info": {
                "type": "object",
                "required": ["title", "version"],
                "properties": {
                    "title": { "type": "string" },
                    "version": { "type": "string" }
                }
            },
            "defaultContentType": { "type": "string" },
            "servers": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "anyOf": [
                        { "required": ["$ref"] },
                        {
                            "required": ["host", "protocol"],
                            "properties": {
                                "host": { "type": "string" },
                                "protocol": { "type": "string" }
                            }
                        }
                    ]
                }
            },
            "channels": {
                "type": "object",
                "additionalProperties": { "type": "object" }
            },
            "operations": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "anyOf": [
                        { "required": ["$ref"] },
                        {
                            "required": ["action", "channel"],
                            "properties": {
                                "action": { "enum": ["send", "receive"] },
                                "channel": { "type": "object" }
                            }
                        }
                    ]
                }
            }
        }
    })
}

/// Check the document skeleton, reporting every violation in one error.
pub fn check_structure(root: &Value) -> Result<(), ParseError> {
    let schema = structural_schema();
    let validator = jsonschema::options().build(&schema).map_err(|e| {
        ParseError::SchemaInvalid(format!("structural schema failed to compile: {}", e))
    })?;

    let problems: Vec<String> = validator
        .iter_errors(root)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ParseError::SchemaInvalid(problems.join("; ")))
    }
}
