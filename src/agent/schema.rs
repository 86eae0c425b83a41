use crate::models::HandlerConfig;
use serde_json::{json, Map, Value};

/// The legacy shapes a stored parameter schema can take. Catalogs written by
/// several generations of the admin surface hold all of these side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredSchema {
    /// `{"type": "function", "function": {"parameters": ...}}`
    FunctionWrapper,
    /// `{"parameters": ...}` with no top-level `type`
    ParametersOnly,
    /// A bare JSON-Schema object (`type: "object"`, or `properties`/`required`)
    RawObject,
    /// Anything else, resolved to the permissive fallback
    Unknown,
}

impl StoredSchema {
    /// Classify a stored value. Total: every JSON value maps to a variant.
    pub fn classify(value: &Value) -> StoredSchema {
        let Some(obj) = value.as_object() else {
            return StoredSchema::Unknown;
        };

        let is_wrapper = obj.get("type").and_then(Value::as_str) == Some("function")
            || obj.get("function").is_some_and(Value::is_object);
        if is_wrapper {
            return StoredSchema::FunctionWrapper;
        }

        if obj.contains_key("parameters") && !obj.contains_key("type") {
            return StoredSchema::ParametersOnly;
        }

        if obj.get("type").and_then(Value::as_str) == Some("object")
            || obj.contains_key("properties")
            || obj.contains_key("required")
        {
            return StoredSchema::RawObject;
        }

        StoredSchema::Unknown
    }
}

/// Maximally permissive fallback schema.
fn permissive() -> Value {
    json!({"type": "object", "additionalProperties": true})
}

/// Resolve any stored schema shape into one canonical object schema.
///
/// Total (no input shape raises) and idempotent on canonical input. The
/// fallback is always available, so schema malformation is never surfaced as
/// an error.
pub fn normalize(stored: &Value) -> Value {
    match StoredSchema::classify(stored) {
        StoredSchema::FunctionWrapper => {
            let inner = stored
                .get("function")
                .and_then(|f| f.get("parameters"))
                .cloned()
                .unwrap_or(Value::Null);
            normalize(&inner)
        }
        StoredSchema::ParametersOnly => {
            let inner = stored.get("parameters").cloned().unwrap_or(Value::Null);
            normalize(&inner)
        }
        StoredSchema::RawObject => {
            let mut obj = stored
                .as_object()
                .cloned()
                .unwrap_or_else(Map::new);
            obj.insert("type".to_string(), json!("object"));
            obj.entry("additionalProperties".to_string())
                .or_insert(json!(true));
            Value::Object(obj)
        }
        StoredSchema::Unknown => permissive(),
    }
}

/// Remove context-supplied properties from a normalized schema so the model
/// is never invited to guess a value the runtime supplies authoritatively.
pub fn redact(mut schema: Value, handler: &HandlerConfig) -> Value {
    let context_fields = handler.context_fields();
    if context_fields.is_empty() {
        return schema;
    }

    if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
        for field in context_fields {
            properties.remove(field);
        }
    }

    if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
        required.retain(|entry| {
            entry
                .as_str()
                .is_none_or(|name| !context_fields.iter().any(|f| f == name))
        });
    }

    schema
}
