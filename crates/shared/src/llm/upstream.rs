use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::models::{ChatCompletionRequest, ChatMessage};

pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamReply, UpstreamError>> + Send + 'a>>;

/// One transformed request sent to the fixed upstream endpoint. The trait
/// seam exists so the retry controller and tests can stub the exchange.
/// The caller's bearer token and User-Agent travel with every request.
pub trait UpstreamExchange: Send + Sync {
    fn send<'a>(
        &'a self,
        bearer_token: &'a str,
        user_agent: Option<&'a str>,
        body: Value,
    ) -> ExchangeFuture<'a>;
}

#[derive(Debug, Clone)]
pub enum UpstreamReply {
    Success(Value),
    /// Non-success upstream status; relayed to the caller unmodified.
    Error {
        status: u16,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to upstream service timed out")]
    Timeout,
    #[error("upstream request failed: {0}")]
    Connect(String),
    #[error("upstream returned an unreadable body: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum UpstreamBuildError {
    #[error("failed to build upstream http client: {0}")]
    HttpClient(String),
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamBuildError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| UpstreamBuildError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn post_raw(
        &self,
        bearer_token: &str,
        user_agent: Option<&str>,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut builder = self
            .client
            .post(&self.config.chat_completions_url)
            .bearer_auth(bearer_token)
            .json(body);
        if let Some(agent) = user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, agent);
        }
        builder
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Connect(err.to_string())
                }
            })
    }

    /// Opens a streaming exchange; the caller consumes the live byte stream.
    pub async fn send_stream(
        &self,
        bearer_token: &str,
        user_agent: Option<&str>,
        body: Value,
    ) -> Result<UpstreamStreamReply, UpstreamError> {
        let response = self.post_raw(bearer_token, user_agent, &body).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|err| UpstreamError::InvalidPayload(err.to_string()))?;
            return Ok(UpstreamStreamReply::Error {
                status: status.as_u16(),
                body,
            });
        }
        Ok(UpstreamStreamReply::Stream(response))
    }
}

impl UpstreamExchange for UpstreamClient {
    fn send<'a>(
        &'a self,
        bearer_token: &'a str,
        user_agent: Option<&'a str>,
        body: Value,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            let response = self.post_raw(bearer_token, user_agent, &body).await?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| UpstreamError::InvalidPayload(err.to_string()))?;

            if !status.is_success() {
                return Ok(UpstreamReply::Error {
                    status: status.as_u16(),
                    body: text,
                });
            }

            let parsed = serde_json::from_str::<Value>(&text)
                .map_err(|err| UpstreamError::InvalidPayload(err.to_string()))?;
            Ok(UpstreamReply::Success(parsed))
        })
    }
}

pub enum UpstreamStreamReply {
    Stream(reqwest::Response),
    Error { status: u16, body: String },
}

/// Builds the body actually sent upstream: inbound shape mirrored, model
/// substituted, reasoning effort forced, tools/response_format stripped and
/// the overlay-augmented message list swapped in.
pub fn build_upstream_body(
    request: &ChatCompletionRequest,
    messages: &[ChatMessage],
    config: &UpstreamConfig,
    temperature_override: Option<f64>,
) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(config.model));
    body.insert(
        "reasoning_effort".to_string(),
        json!(config.reasoning_effort),
    );
    body.insert(
        "messages".to_string(),
        serde_json::to_value(messages).unwrap_or_else(|_| json!([])),
    );
    if request.stream {
        body.insert("stream".to_string(), json!(true));
    }
    if let Some(temperature) = temperature_override.or(request.temperature) {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    for (key, value) in &request.extra {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(body)
}

/// Reads the first choice's message content out of an upstream response body.
pub fn message_content(response: &Value) -> &str {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build_upstream_body, message_content};
    use crate::config::UpstreamConfig;
    use crate::models::{ChatCompletionRequest, ChatMessage};

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            chat_completions_url: "https://upstream.example/v1/chat/completions".to_string(),
            model: "fixed-model".to_string(),
            reasoning_effort: "high".to_string(),
            request_timeout_ms: 120_000,
        }
    }

    #[test]
    fn overrides_model_and_forces_reasoning_effort() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "name": "a"}],
            "response_format": {"type": "json_schema"},
            "temperature": 0.7,
            "max_tokens": 500,
            "top_p": 0.9
        }))
        .expect("request should parse");
        let messages = vec![ChatMessage::system("overlay"), request.messages[0].clone()];

        let body = build_upstream_body(&request, &messages, &config(), None);

        assert_eq!(body["model"], json!("fixed-model"));
        assert_eq!(body["reasoning_effort"], json!("high"));
        assert_eq!(body["temperature"], json!(0.7));
        assert_eq!(body["max_tokens"], json!(500));
        assert_eq!(body["top_p"], json!(0.9));
        assert!(body.get("tools").is_none());
        assert!(body.get("response_format").is_none());
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn temperature_override_wins_over_request_value() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.7
        }))
        .expect("request should parse");

        let body = build_upstream_body(&request, &request.messages, &config(), Some(0.3));
        assert_eq!(body["temperature"], json!(0.3));
    }

    #[test]
    fn reads_first_choice_content() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(message_content(&response), "hello");
        assert_eq!(message_content(&json!({})), "");
    }
}
