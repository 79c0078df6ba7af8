use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::models::{ChatMessage, ToolChoice, ToolEntry};

#[derive(Debug, Error)]
pub enum SchemaShapeError {
    #[error("schema cannot be null")]
    Null,
    #[error("schema cannot be empty")]
    Empty,
    #[error("schema must have a 'type' field")]
    MissingType,
    #[error("only object type schemas are supported")]
    UnsupportedType,
    #[error("schema must have a 'properties' field")]
    MissingProperties,
    #[error("properties must be a map of field name to schema")]
    PropertiesNotMap,
}

/// Escalation level used by the retry controller: each failed attempt
/// strengthens the instruction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayStrength {
    Initial,
    JsonOnly,
    WithExample,
}

impl OverlayStrength {
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 => Self::Initial,
            1 => Self::JsonOnly,
            _ => Self::WithExample,
        }
    }
}

/// Restricted-dialect shape check applied before any schema emulation:
/// object type, `properties` a field map, nothing else is accepted.
pub fn check_schema_shape(schema: Option<&Value>) -> Result<(), SchemaShapeError> {
    let schema = match schema {
        None | Some(Value::Null) => return Err(SchemaShapeError::Null),
        Some(value) => value,
    };
    let object = schema.as_object().ok_or(SchemaShapeError::Empty)?;
    if object.is_empty() {
        return Err(SchemaShapeError::Empty);
    }

    let kind = object.get("type").ok_or(SchemaShapeError::MissingType)?;
    if kind.as_str() != Some("object") {
        return Err(SchemaShapeError::UnsupportedType);
    }

    let properties = object
        .get("properties")
        .ok_or(SchemaShapeError::MissingProperties)?;
    if !properties.is_object() {
        return Err(SchemaShapeError::PropertiesNotMap);
    }

    Ok(())
}

/// Merges the overlay into the message list: exactly one leading system
/// message carrying any pre-existing system content followed by the overlay;
/// relative order of non-system messages is preserved.
fn merge_overlay(messages: &[ChatMessage], overlay: &str) -> Vec<ChatMessage> {
    let existing_system = messages
        .iter()
        .filter(|message| message.role == "system")
        .filter_map(|message| message.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n");

    let system_content = if existing_system.is_empty() {
        overlay.to_string()
    } else {
        format!("{existing_system}\n\n{overlay}")
    };

    let mut merged = Vec::with_capacity(messages.len() + 1);
    merged.push(ChatMessage::system(system_content));
    merged.extend(
        messages
            .iter()
            .filter(|message| message.role != "system")
            .cloned(),
    );
    merged
}

pub fn apply_schema_overlay(
    messages: &[ChatMessage],
    schema: &Value,
    schema_name: &str,
    strength: OverlayStrength,
) -> Vec<ChatMessage> {
    let required = schema
        .get("required")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let schema_text =
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());

    let mut overlay = format!(
        "STRUCTURED OUTPUT REQUIRED:\n\n\
         You must respond with valid JSON that exactly matches this schema:\n\n\
         Schema name: {schema_name}\n\
         Schema: {schema_text}\n\n\
         CRITICAL REQUIREMENTS:\n\
         1. Your response must be ONLY valid JSON - no additional text\n\
         2. All required fields must be present: {required}\n\
         3. Field types must match the schema exactly\n\
         4. No additional properties unless allowed by the schema\n\
         5. If you use reasoning mode (<think> tags), place the JSON response AFTER the </think> closing tag\n\
         6. Do not wrap the JSON in code blocks or explanatory text\n\n\
         Example format:\n\
         {{\"field1\": \"value1\", \"field2\": true, \"field3\": \"value3\"}}"
    );

    match strength {
        OverlayStrength::Initial => {}
        OverlayStrength::JsonOnly => {
            overlay.push_str(
                "\n\nIMPORTANT: You MUST respond with ONLY valid JSON. Do not include any \
                 explanatory text, code blocks, or reasoning. Just the raw JSON object.",
            );
        }
        OverlayStrength::WithExample => {
            let example = schema_example(schema);
            overlay.push_str(&format!(
                "\n\nEXAMPLE OUTPUT:\n{example}\n\nRespond with EXACTLY this format - pure JSON only."
            ));
        }
    }

    merge_overlay(messages, &overlay)
}

pub fn apply_tool_overlay(
    messages: &[ChatMessage],
    tools: &[ToolEntry],
    tool_choice: &ToolChoice,
) -> Vec<ChatMessage> {
    let mut signatures = Vec::new();
    for tool in tools {
        if tool.kind != "function" {
            continue;
        }
        let Some(descriptor) = tool.descriptor() else {
            continue;
        };
        let parameters = descriptor
            .parameters
            .as_ref()
            .map(|value| {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            })
            .unwrap_or_else(|| "{}".to_string());
        signatures.push(format!(
            "Function: {}\nDescription: {}\nParameters: {}\n",
            descriptor.name,
            descriptor.description.as_deref().unwrap_or(""),
            parameters
        ));
    }

    let tool_choice_label = match tool_choice {
        ToolChoice::Mode(mode) => mode.clone(),
        ToolChoice::Forced(_) => "forced".to_string(),
    };

    let mut overlay = format!(
        "You are an AI assistant with access to the following functions:\n\n\
         {}\n\
         IMPORTANT INSTRUCTIONS:\n\
         1. When the user's request requires calling one or more functions, you should:\n\
            - Think through the problem in <think> tags if needed\n\
            - After your thinking, provide the function calls as a JSON array\n\n\
         2. Each function call should have this exact format:\n\
            {{\n\
              \"type\": \"function_call\",\n\
              \"id\": \"fc_<random_id>\",\n\
              \"call_id\": \"call_<random_id>\",\n\
              \"name\": \"<function_name>\",\n\
              \"arguments\": \"<json_string_of_arguments>\"\n\
            }}\n\n\
         3. If multiple functions need to be called, return multiple objects in the array.\n\
         4. If no functions need to be called, respond normally with text.\n\
         5. The \"arguments\" field must be a JSON string (not an object).\n\
         6. Make sure the JSON is valid and properly formatted.\n\
         7. IMPORTANT: If you use reasoning mode (<think> tags), place the function call JSON AFTER the </think> closing tag.\n\n\
         Tool choice setting: {}",
        signatures.join("\n"),
        tool_choice_label
    );

    if tool_choice.is_required() {
        overlay.push_str(
            "\n\nCRITICAL: You MUST call at least one function for this request. This is \
             MANDATORY. Even if the user's message doesn't seem to need a function, you must \
             choose the most appropriate one and call it with reasonable parameters. Do not \
             respond with regular text - you MUST return a JSON array with at least one \
             function call.",
        );
    } else if let Some(forced) = tool_choice.forced_function_name() {
        overlay.push_str(&format!(
            "\n\nYou MUST call the function '{forced}' for this request. This is required \
             regardless of what the user asks."
        ));
    }

    merge_overlay(messages, &overlay)
}

/// Synthesizes a plausible example object from the schema, type-driven with
/// field-name heuristics. Union fields use the first alternative.
pub fn schema_example(schema: &Value) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return "{\"field\": \"value\"}".to_string();
    };

    let mut example = Map::new();
    for (field_name, field_schema) in properties {
        let effective = field_schema
            .get("anyOf")
            .and_then(Value::as_array)
            .and_then(|options| options.first())
            .unwrap_or(field_schema);
        example.insert(field_name.clone(), field_example(field_name, effective));
    }

    serde_json::to_string_pretty(&Value::Object(example))
        .unwrap_or_else(|_| "{\"field\": \"value\"}".to_string())
}

fn field_example(field_name: &str, field_schema: &Value) -> Value {
    let lowered = field_name.to_lowercase();
    match field_schema.get("type").and_then(Value::as_str) {
        Some("string") => {
            if lowered.contains("name") {
                json!("John Doe")
            } else if lowered.contains("reason") {
                json!("This is a valid reason")
            } else if lowered.contains("answer") {
                json!("This is the answer")
            } else {
                json!("example_value")
            }
        }
        Some("boolean") => json!(true),
        Some("integer") => {
            if lowered.contains("age") {
                json!(30)
            } else {
                json!(42)
            }
        }
        Some("number") => json!(3.14),
        Some("array") => json!(["example_item"]),
        Some("object") => json!({"example_key": "example_value"}),
        _ => json!("example"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        OverlayStrength, SchemaShapeError, apply_schema_overlay, apply_tool_overlay,
        check_schema_shape, schema_example,
    };
    use crate::models::{ChatMessage, ToolChoice, ToolEntry};

    fn person_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"}
            },
            "required": ["name", "age"]
        })
    }

    #[test]
    fn rejects_malformed_schema_shapes() {
        assert!(matches!(check_schema_shape(None), Err(SchemaShapeError::Null)));
        assert!(matches!(
            check_schema_shape(Some(&json!(null))),
            Err(SchemaShapeError::Null)
        ));
        assert!(matches!(
            check_schema_shape(Some(&json!({}))),
            Err(SchemaShapeError::Empty)
        ));
        assert!(matches!(
            check_schema_shape(Some(&json!({"properties": {}}))),
            Err(SchemaShapeError::MissingType)
        ));
        assert!(matches!(
            check_schema_shape(Some(&json!({"type": "array", "properties": {}}))),
            Err(SchemaShapeError::UnsupportedType)
        ));
        assert!(matches!(
            check_schema_shape(Some(&json!({"type": "object"}))),
            Err(SchemaShapeError::MissingProperties)
        ));
        assert!(matches!(
            check_schema_shape(Some(&json!({"type": "object", "properties": []}))),
            Err(SchemaShapeError::PropertiesNotMap)
        ));
        assert!(check_schema_shape(Some(&person_schema())).is_ok());
    }

    #[test]
    fn merges_single_leading_system_message() {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: Some("Existing guidance.".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: Some("first".to_string()),
            },
            ChatMessage {
                role: "assistant".to_string(),
                content: Some("reply".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: Some("second".to_string()),
            },
        ];

        let merged =
            apply_schema_overlay(&messages, &person_schema(), "person", OverlayStrength::Initial);

        let system_count = merged.iter().filter(|m| m.role == "system").count();
        assert_eq!(system_count, 1);
        assert_eq!(merged[0].role, "system");
        let system_content = merged[0].content.as_deref().expect("system content");
        assert!(system_content.starts_with("Existing guidance."));
        assert!(system_content.contains("STRUCTURED OUTPUT REQUIRED"));

        let rest: Vec<_> = merged[1..].iter().map(|m| m.role.as_str()).collect();
        assert_eq!(rest, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn inserts_system_message_when_none_exists() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Some("hi".to_string()),
        }];

        let merged =
            apply_schema_overlay(&messages, &person_schema(), "person", OverlayStrength::Initial);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].role, "system");
    }

    #[test]
    fn escalation_levels_strengthen_the_overlay() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Some("hi".to_string()),
        }];

        let json_only =
            apply_schema_overlay(&messages, &person_schema(), "person", OverlayStrength::JsonOnly);
        assert!(
            json_only[0]
                .content
                .as_deref()
                .expect("content")
                .contains("ONLY valid JSON")
        );

        let with_example = apply_schema_overlay(
            &messages,
            &person_schema(),
            "person",
            OverlayStrength::WithExample,
        );
        let content = with_example[0].content.as_deref().expect("content");
        assert!(content.contains("EXAMPLE OUTPUT"));
        assert!(content.contains("John Doe"));
    }

    #[test]
    fn tool_overlay_enforces_tool_choice() {
        let tools: Vec<ToolEntry> = serde_json::from_value(json!([
            {
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get weather",
                    "parameters": {"type": "object", "properties": {"location": {"type": "string"}}}
                }
            }
        ]))
        .expect("tools should parse");
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Some("weather in Tokyo".to_string()),
        }];

        let auto = apply_tool_overlay(&messages, &tools, &ToolChoice::Mode("auto".to_string()));
        let auto_content = auto[0].content.as_deref().expect("content");
        assert!(auto_content.contains("Function: get_weather"));
        assert!(!auto_content.contains("MANDATORY"));

        let required =
            apply_tool_overlay(&messages, &tools, &ToolChoice::Mode("required".to_string()));
        assert!(
            required[0]
                .content
                .as_deref()
                .expect("content")
                .contains("MUST call at least one function")
        );

        let forced: ToolChoice = serde_json::from_value(
            json!({"type": "function", "function": {"name": "get_weather"}}),
        )
        .expect("forced choice");
        let forced_messages = apply_tool_overlay(&messages, &tools, &forced);
        assert!(
            forced_messages[0]
                .content
                .as_deref()
                .expect("content")
                .contains("MUST call the function 'get_weather'")
        );
    }

    #[test]
    fn example_synthesis_uses_field_name_heuristics() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"},
                "score": {"type": "number"},
                "is_valid": {"anyOf": [{"type": "boolean"}, {"type": "string"}]},
                "tags": {"type": "array"}
            }
        });

        let example: serde_json::Value =
            serde_json::from_str(&schema_example(&schema)).expect("example should parse");
        assert_eq!(example["name"], json!("John Doe"));
        assert_eq!(example["age"], json!(30));
        assert_eq!(example["score"], json!(3.14));
        assert_eq!(example["is_valid"], json!(true));
        assert_eq!(example["tags"], json!(["example_item"]));
    }
}
