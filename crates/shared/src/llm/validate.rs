use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("required field '{field}' missing from response")]
    MissingRequired { field: String },
    #[error("field '{field}' has invalid type. Expected: {expected}, Got: {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: &'static str,
    },
    #[error("additional property '{field}' not allowed")]
    AdditionalProperty { field: String },
}

/// Checks a response value against the restricted schema dialect: required
/// presence, declared type (with `anyOf` unions of primitives), and
/// `additionalProperties: false` enforcement.
pub fn validate_against_schema(response: &Value, schema: &Value) -> Result<(), ValidationError> {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let response_object = match response.as_object() {
        Some(object) => object,
        None => {
            return Err(ValidationError::TypeMismatch {
                field: "$".to_string(),
                expected: "object".to_string(),
                actual: type_name(response),
            });
        }
    };

    for field in required.iter().filter_map(Value::as_str) {
        if !response_object.contains_key(field) {
            return Err(ValidationError::MissingRequired {
                field: field.to_string(),
            });
        }
    }

    for (field, value) in response_object {
        if let Some(field_schema) = properties.get(field) {
            if !field_matches(value, field_schema) {
                return Err(ValidationError::TypeMismatch {
                    field: field.clone(),
                    expected: expected_types(field_schema),
                    actual: type_name(value),
                });
            }
        } else if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            return Err(ValidationError::AdditionalProperty {
                field: field.clone(),
            });
        }
    }

    Ok(())
}

/// A field declaring `anyOf` is valid when the value matches any alternative.
fn field_matches(value: &Value, field_schema: &Value) -> bool {
    if let Some(options) = field_schema.get("anyOf").and_then(Value::as_array) {
        return options.iter().any(|option| matches_simple(value, option));
    }
    matches_simple(value, field_schema)
}

fn matches_simple(value: &Value, type_schema: &Value) -> bool {
    match type_schema.get("type").and_then(Value::as_str) {
        Some("boolean") => value.is_boolean(),
        Some("string") => value.is_string(),
        Some("number") => value.is_number(),
        Some("integer") => value.is_i64() || value.is_u64(),
        Some("array") => value.is_array(),
        Some("object") => value.is_object(),
        _ => false,
    }
}

fn expected_types(field_schema: &Value) -> String {
    if let Some(options) = field_schema.get("anyOf").and_then(Value::as_array) {
        let names: Vec<&str> = options
            .iter()
            .filter_map(|option| option.get("type").and_then(Value::as_str))
            .collect();
        return names.join(" | ");
    }
    field_schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) => {
            if number.is_i64() || number.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
