use serde_json::Value;

const SENSITIVE_KEYS: [&str; 8] = [
    "authorization",
    "api_key",
    "apikey",
    "api-key",
    "x-api-key",
    "bearer",
    "token",
    "secret",
];

pub const REDACTION_MARKER: &str = "[REDACTED]";

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lowered.as_str())
}

/// Redacts denylisted keys at the payload's top level and within one nested
/// `headers` map. Non-matching keys are never altered.
pub fn sanitize_payload(payload: &Value) -> Value {
    let Some(object) = payload.as_object() else {
        return payload.clone();
    };

    let mut sanitized = object.clone();
    for (key, value) in sanitized.iter_mut() {
        if is_sensitive(key) {
            *value = Value::String(REDACTION_MARKER.to_string());
        }
    }

    if let Some(headers) = sanitized.get_mut("headers").and_then(Value::as_object_mut) {
        for (key, value) in headers.iter_mut() {
            if is_sensitive(key) {
                *value = Value::String(REDACTION_MARKER.to_string());
            }
        }
    }

    Value::Object(sanitized)
}
