use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const CALL_DISCRIMINATOR: &str = "function_call";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no valid JSON found in response")]
    NoJsonFound,
}

/// One function call recovered from model text. Ids are generated when the
/// model omitted them so downstream correlation always works.
#[derive(Debug, Clone)]
pub struct ExtractedCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedCalls {
    pub calls: Vec<ExtractedCall>,
    pub remaining_text: Option<String>,
}

pub fn generate_call_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

/// Returns the non-empty content after a paired reasoning trace, or the full
/// text when no pair is present.
fn post_reasoning(text: &str) -> &str {
    if text.contains(THINK_OPEN)
        && let Some(position) = text.find(THINK_CLOSE)
    {
        let after = text[position + THINK_CLOSE.len()..].trim();
        if !after.is_empty() {
            return after;
        }
    }
    text
}

/// Finds the first balanced `open`..`close` span starting at or after
/// `from`, honoring JSON string literals and escapes. Returns byte bounds.
fn balanced_span(text: &str, from: usize, open: char, close: char) -> Option<(usize, usize)> {
    let start = text[from..].find(open)? + from;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset + close.len_utf8()));
                }
            }
            _ => {}
        }
    }
    None
}

fn call_from_object(object: &Value) -> Option<ExtractedCall> {
    let object = object.as_object()?;
    if object.get("type").and_then(Value::as_str) != Some(CALL_DISCRIMINATOR) {
        return None;
    }
    let name = object.get("name")?.as_str()?.to_string();
    let arguments = match object.get("arguments") {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ExtractedCall {
        id: object
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| generate_call_id("fc")),
        call_id: object
            .get("call_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| generate_call_id("call")),
        name,
        arguments,
    })
}

/// Scans model text for emulated function calls: the first well-formed JSON
/// array whose entries carry the call discriminator, falling back to the
/// first matching single object. The matched literal is removed from the
/// residual free text.
pub fn parse_function_calls(content: &str) -> ExtractedCalls {
    let working = post_reasoning(content);

    let mut search_from = 0usize;
    while let Some((start, end)) = balanced_span(working, search_from, '[', ']') {
        let span = &working[start..end];
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(span) {
            let calls: Vec<ExtractedCall> = items.iter().filter_map(call_from_object).collect();
            if !calls.is_empty() {
                return ExtractedCalls {
                    calls,
                    remaining_text: residual_text(content, span),
                };
            }
        }
        search_from = start + 1;
    }

    // No array produced any call objects; try a single bare object.
    let mut search_from = 0usize;
    while let Some((start, end)) = balanced_span(working, search_from, '{', '}') {
        let span = &working[start..end];
        if let Ok(parsed) = serde_json::from_str::<Value>(span)
            && let Some(call) = call_from_object(&parsed)
        {
            return ExtractedCalls {
                calls: vec![call],
                remaining_text: residual_text(content, span),
            };
        }
        search_from = start + 1;
    }

    ExtractedCalls {
        calls: Vec::new(),
        remaining_text: Some(content.to_string()).filter(|text| !text.trim().is_empty()),
    }
}

fn residual_text(content: &str, matched: &str) -> Option<String> {
    let remaining = content.replacen(matched, "", 1).trim().to_string();
    (!remaining.is_empty()).then_some(remaining)
}

/// Ordered, independent parsing strategies, tried until one yields JSON.
fn parse_whole(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn parse_fenced_json(text: &str) -> Option<Value> {
    parse_fence(text, "```json")
}

fn parse_any_fence(text: &str) -> Option<Value> {
    parse_fence(text, "```")
}

fn parse_fence(text: &str, marker: &str) -> Option<Value> {
    let start = text.find(marker)? + marker.len();
    let end = text[start..].find("```")? + start;
    serde_json::from_str(text[start..end].trim()).ok()
}

fn parse_brace_span(text: &str) -> Option<Value> {
    let (start, end) = balanced_span(text, 0, '{', '}')?;
    serde_json::from_str(text[start..end].trim()).ok()
}

/// Recovers a JSON value from free-form model text for the schema path.
/// Failure here is an extraction failure, distinct from schema validation.
pub fn extract_json_from_text(text: &str) -> Result<Value, ExtractError> {
    let working = post_reasoning(text);

    let strategies: [fn(&str) -> Option<Value>; 4] = [
        parse_whole,
        parse_fenced_json,
        parse_any_fence,
        parse_brace_span,
    ];
    strategies
        .iter()
        .find_map(|strategy| strategy(working))
        .ok_or(ExtractError::NoJsonFound)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{extract_json_from_text, parse_function_calls, post_reasoning};

    #[test]
    fn skips_reasoning_trace_before_extraction() {
        let text = "<think>deliberating...</think>\n{\"name\":\"Alice\",\"age\":30}";
        let value = extract_json_from_text(text).expect("json after trace");
        assert_eq!(value, json!({"name": "Alice", "age": 30}));
    }

    #[test]
    fn falls_back_to_full_text_when_trace_is_empty_after_close() {
        let text = "<think>only thoughts</think>   ";
        assert_eq!(post_reasoning(text), text);
    }

    #[test]
    fn extracts_from_tagged_fence_before_untagged() {
        let text = "Here you go:\n```json\n{\"ok\": true}\n```";
        assert_eq!(extract_json_from_text(text).expect("fenced json"), json!({"ok": true}));

        let untagged = "Result:\n```\n{\"ok\": false}\n```";
        assert_eq!(
            extract_json_from_text(untagged).expect("untagged fence"),
            json!({"ok": false})
        );
    }

    #[test]
    fn extracts_first_brace_span_from_prose() {
        let text = "The answer is {\"name\": \"Bob\", \"note\": \"has {braces} in string\"} done";
        let value = extract_json_from_text(text).expect("brace span");
        assert_eq!(value["name"], json!("Bob"));
    }

    #[test]
    fn reports_extraction_failure_on_plain_prose() {
        assert!(extract_json_from_text("no structured data here").is_err());
    }

    #[test]
    fn parses_call_array_and_generates_missing_ids() {
        let text = r#"Calling now: [{"type":"function_call","name":"get_weather","arguments":"{\"location\":\"Tokyo\"}"}]"#;
        let extracted = parse_function_calls(text);
        assert_eq!(extracted.calls.len(), 1);
        let call = &extracted.calls[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"location":"Tokyo"}"#);
        assert!(call.id.starts_with("fc_"));
        assert!(call.call_id.starts_with("call_"));
        assert_eq!(extracted.remaining_text.as_deref(), Some("Calling now:"));
    }

    #[test]
    fn keeps_provided_ids_and_ignores_non_call_entries() {
        let text = r#"[{"type":"function_call","id":"fc_x","call_id":"call_x","name":"a","arguments":"{}"},{"type":"other","name":"b"}]"#;
        let extracted = parse_function_calls(text);
        assert_eq!(extracted.calls.len(), 1);
        assert_eq!(extracted.calls[0].id, "fc_x");
        assert_eq!(extracted.calls[0].call_id, "call_x");
        assert!(extracted.remaining_text.is_none());
    }

    #[test]
    fn falls_back_to_single_call_object() {
        let text = r#"<think>pick one</think>{"type":"function_call","name":"lookup","arguments":"{\"q\":\"rust\"}"}"#;
        let extracted = parse_function_calls(text);
        assert_eq!(extracted.calls.len(), 1);
        assert_eq!(extracted.calls[0].name, "lookup");
    }

    #[test]
    fn plain_text_yields_no_calls_and_keeps_text() {
        let extracted = parse_function_calls("It is sunny in Tokyo today.");
        assert!(extracted.calls.is_empty());
        assert_eq!(
            extracted.remaining_text.as_deref(),
            Some("It is sunny in Tokyo today.")
        );
    }

    #[test]
    fn array_inside_reasoning_trace_is_ignored() {
        let text = r#"<think>[{"type":"function_call","name":"wrong","arguments":"{}"}]</think>All done, no call needed."#;
        let extracted = parse_function_calls(text);
        assert!(extracted.calls.is_empty());
    }
}
