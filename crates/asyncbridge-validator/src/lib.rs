//! Payload validation for AsyncAPI bindings.
//!
//! Checks outbound and inbound payloads against the flattened top-level
//! fields of a message schema before they are dispatched.

use serde_json::Value;
use thiserror::Error;

use asyncbridge_spec::{PayloadSchema, SchemaField};

/// Validation errors returned when a payload doesn't conform to its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: &'static str,
    },
}

impl PayloadError {
    /// The offending field name.
    pub fn field(&self) -> &str {
        match self {
            Self::MissingField(field) => field,
            Self::TypeMismatch { field, .. } => field,
        }
    }
}

/// Validate `payload` against `schema`, stopping at the first violation.
///
/// Non-object payloads and empty schemas are accepted unchecked. Only
/// `string` and `integer` fields are type-checked; `integer` accepts any
/// JSON number.
pub fn validate(payload: &Value, schema: &PayloadSchema) -> Result<(), PayloadError> {
    let Some(obj) = payload.as_object() else {
        return Ok(());
    };

    for field in schema.fields() {
        let value = obj
            .get(&field.name)
            .ok_or_else(|| PayloadError::MissingField(field.name.clone()))?;
        check_type(field, value)?;
    }
    Ok(())
}

fn check_type(field: &SchemaField, value: &Value) -> Result<(), PayloadError> {
    let ok = match field.field_type.as_deref() {
        Some("string") => value.is_string(),
        Some("integer") => value.is_number(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(PayloadError::TypeMismatch {
            field: field.name.clone(),
            expected: field.field_type.clone().unwrap_or_default(),
            actual: json_type_name(value),
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
