use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }
}

/// Tool descriptor accepting both the flat shape and the shape nested under
/// a `function` key; `descriptor()` resolves to the inner function either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub function: Option<FunctionDescriptor>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl ToolEntry {
    pub fn descriptor(&self) -> Option<FunctionDescriptor> {
        if let Some(function) = &self.function {
            return Some(function.clone());
        }
        self.name.as_ref().map(|name| FunctionDescriptor {
            name: name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Forced(ForcedToolChoice),
}

impl Default for ToolChoice {
    fn default() -> Self {
        Self::Mode("auto".to_string())
    }
}

impl ToolChoice {
    pub fn forced_function_name(&self) -> Option<&str> {
        match self {
            Self::Forced(forced) if forced.kind == "function" => {
                Some(forced.function.name.as_str())
            }
            _ => None,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Mode(mode) if mode == "required")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedToolChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ForcedFunctionName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedFunctionName {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub json_schema: Option<JsonSchemaFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// Inbound chat-completion request. Unknown sampling parameters are carried
/// in `extra` so the upstream body mirrors whatever the caller sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: AssistantMessage,
    pub logprobs: Option<Value>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkToolCall {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                param: None,
                details: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatCompletionRequest, ToolChoice};

    #[test]
    fn parses_flat_and_nested_tool_shapes() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"type": "function", "name": "a", "description": "flat", "parameters": {}},
                {"type": "function", "function": {"name": "b", "description": "nested"}}
            ]
        });

        let request: ChatCompletionRequest =
            serde_json::from_value(body).expect("request should parse");
        let tools = request.tools.expect("tools present");
        assert_eq!(tools[0].descriptor().expect("flat descriptor").name, "a");
        assert_eq!(tools[1].descriptor().expect("nested descriptor").name, "b");
    }

    #[test]
    fn parses_tool_choice_variants() {
        let required: ToolChoice =
            serde_json::from_value(json!("required")).expect("string variant");
        assert!(required.is_required());

        let forced: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "get_weather"}}))
                .expect("forced variant");
        assert_eq!(forced.forced_function_name(), Some("get_weather"));
    }

    #[test]
    fn carries_unknown_sampling_parameters() {
        let body = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "top_p": 0.9,
            "stream": true
        });

        let request: ChatCompletionRequest =
            serde_json::from_value(body).expect("request should parse");
        assert!(request.stream);
        assert_eq!(request.extra.get("top_p"), Some(&json!(0.9)));
    }
}
