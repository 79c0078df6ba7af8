use serde_json::Value;
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::models::ChatCompletionRequest;

use super::extract::extract_json_from_text;
use super::overlay::{OverlayStrength, apply_schema_overlay};
use super::upstream::{
    UpstreamError, UpstreamExchange, UpstreamReply, build_upstream_body, message_content,
};
use super::validate::validate_against_schema;

const DEFAULT_BASE_TEMPERATURE: f64 = 0.7;
const TEMPERATURE_STEP: f64 = 0.2;
const TEMPERATURE_FLOOR: f64 = 0.1;
const CONTENT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub temperature_step: f64,
    pub temperature_floor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            temperature_step: TEMPERATURE_STEP,
            temperature_floor: TEMPERATURE_FLOOR,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Monotonically non-increasing schedule with a floor; attempt 0 keeps
    /// the caller's own temperature.
    fn temperature_for_attempt(&self, base: Option<f64>, attempt: u32) -> Option<f64> {
        if attempt == 0 {
            return None;
        }
        let base = base.unwrap_or(DEFAULT_BASE_TEMPERATURE);
        Some((base - f64::from(attempt) * self.temperature_step).max(self.temperature_floor))
    }
}

#[derive(Debug, Clone)]
pub struct StructuredSuccess {
    pub json: Value,
    pub attempts: u32,
    pub upstream_response: Value,
}

/// All retries exhausted; surfaced to the caller as a client error.
#[derive(Debug, Clone)]
pub struct StructuredFailure {
    pub attempts: u32,
    pub last_error: String,
    pub content_preview: String,
}

#[derive(Debug, Error)]
pub enum StructuredRunError {
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] UpstreamError),
    #[error("structured output validation failed after {} attempts: {}", .0.attempts, .0.last_error)]
    Exhausted(StructuredFailure),
}

/// Schema-emulation retry loop, non-streaming only. Exchanges are strictly
/// sequential; each failed attempt lowers the temperature and strengthens
/// the overlay before the next exchange.
pub async fn run_structured_exchange<E>(
    exchange: &E,
    bearer_token: &str,
    user_agent: Option<&str>,
    request: &ChatCompletionRequest,
    schema: &Value,
    schema_name: &str,
    upstream_config: &UpstreamConfig,
    policy: &RetryPolicy,
) -> Result<StructuredSuccess, StructuredRunError>
where
    E: UpstreamExchange + ?Sized,
{
    let mut last_error = String::new();
    let mut last_content = String::new();

    for attempt in 0..policy.max_attempts {
        let strength = OverlayStrength::for_attempt(attempt);
        let messages = apply_schema_overlay(&request.messages, schema, schema_name, strength);
        let temperature = policy.temperature_for_attempt(request.temperature, attempt);
        let body = build_upstream_body(request, &messages, upstream_config, temperature);

        let reply = exchange.send(bearer_token, user_agent, body).await?;
        let response = match reply {
            UpstreamReply::Success(response) => response,
            UpstreamReply::Error { status, body } => {
                return Err(StructuredRunError::Upstream { status, body });
            }
        };

        let content = message_content(&response).to_string();
        let outcome = extract_json_from_text(&content)
            .map_err(|err| err.to_string())
            .and_then(|value| {
                validate_against_schema(&value, schema)
                    .map(|()| value)
                    .map_err(|err| err.to_string())
            });

        match outcome {
            Ok(json) => {
                if attempt > 0 {
                    tracing::debug!(
                        attempt,
                        schema_name,
                        "structured output validated after retries"
                    );
                }
                return Ok(StructuredSuccess {
                    json,
                    attempts: attempt,
                    upstream_response: response,
                });
            }
            Err(error) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    schema_name,
                    error,
                    "structured output validation failed"
                );
                last_error = error;
                last_content = content;
            }
        }
    }

    Err(StructuredRunError::Exhausted(StructuredFailure {
        attempts: policy.max_attempts,
        last_error,
        content_preview: preview(&last_content),
    }))
}

fn preview(content: &str) -> String {
    if content.is_empty() {
        return "No content".to_string();
    }
    match content.char_indices().nth(CONTENT_PREVIEW_CHARS) {
        Some((index, _)) => content[..index].to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{RetryPolicy, preview};

    #[test]
    fn temperature_schedule_is_non_increasing_with_floor() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.temperature_for_attempt(Some(0.7), 0), None);
        let first = policy
            .temperature_for_attempt(Some(0.7), 1)
            .expect("first retry temperature");
        assert!((first - 0.5).abs() < 1e-9);
        let second = policy
            .temperature_for_attempt(Some(0.7), 2)
            .expect("second retry temperature");
        assert!((second - 0.3).abs() < 1e-9);
        assert!(second < first);
        // Far past the schedule the floor holds.
        assert_eq!(policy.temperature_for_attempt(Some(0.2), 5), Some(0.1));
    }

    #[test]
    fn missing_base_temperature_uses_the_default() {
        let policy = RetryPolicy::default();
        let value = policy
            .temperature_for_attempt(None, 1)
            .expect("retry temperature");
        assert!((value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(500);
        assert_eq!(preview(&long).len(), 200);
        assert_eq!(preview("short"), "short");
        assert_eq!(preview(""), "No content");
    }
}
