use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{Value, json};
use shared::config::UpstreamConfig;
use shared::llm::{
    ExchangeFuture, RetryPolicy, StructuredRunError, UpstreamError, UpstreamExchange,
    UpstreamReply, run_structured_exchange,
};
use shared::models::ChatCompletionRequest;

struct StubExchange {
    replies: Mutex<VecDeque<Result<UpstreamReply, UpstreamError>>>,
    bodies: Mutex<Vec<Value>>,
}

impl StubExchange {
    fn new(replies: Vec<Result<UpstreamReply, UpstreamError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn success(content: &str) -> Result<UpstreamReply, UpstreamError> {
        Ok(UpstreamReply::Success(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })))
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

impl UpstreamExchange for StubExchange {
    fn send<'a>(
        &'a self,
        _bearer_token: &'a str,
        _user_agent: Option<&'a str>,
        body: Value,
    ) -> ExchangeFuture<'a> {
        Box::pin(async move {
            self.bodies.lock().unwrap().push(body);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("exchange called more times than scripted")
        })
    }
}

fn person_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer"}
        },
        "required": ["name", "age"]
    })
}

fn request(temperature: Option<f64>) -> ChatCompletionRequest {
    let mut body = json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "Describe Alice as JSON."}]
    });
    if let Some(temperature) = temperature {
        body["temperature"] = json!(temperature);
    }
    serde_json::from_value(body).expect("request should parse")
}

fn upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        chat_completions_url: "https://upstream.example/v1/chat/completions".to_string(),
        model: "fixed-model".to_string(),
        reasoning_effort: "high".to_string(),
        request_timeout_ms: 120_000,
    }
}

fn first_system_content(body: &Value) -> &str {
    body["messages"][0]["content"]
        .as_str()
        .expect("system message content")
}

#[tokio::test]
async fn valid_first_reply_needs_no_retry() {
    let exchange = StubExchange::new(vec![StubExchange::success(
        "<think>easy</think>{\"name\": \"Alice\", \"age\": 30}",
    )]);

    let success = run_structured_exchange(
        &exchange,
        "sk-test",
        None,
        &request(None),
        &person_schema(),
        "person",
        &upstream_config(),
        &RetryPolicy::default(),
    )
    .await
    .expect("structured success");

    assert_eq!(success.json, json!({"name": "Alice", "age": 30}));
    assert_eq!(success.attempts, 0);

    let bodies = exchange.bodies();
    assert_eq!(bodies.len(), 1);
    // First attempt keeps the caller's sampling untouched.
    assert!(bodies[0].get("temperature").is_none());
    assert!(first_system_content(&bodies[0]).contains("STRUCTURED OUTPUT REQUIRED"));
}

#[tokio::test]
async fn retry_lowers_temperature_and_strengthens_overlay() {
    let exchange = StubExchange::new(vec![
        StubExchange::success("Sure! Here is the person you asked about."),
        StubExchange::success("{\"name\": \"Alice\", \"age\": 30}"),
    ]);

    let success = run_structured_exchange(
        &exchange,
        "sk-test",
        None,
        &request(Some(0.7)),
        &person_schema(),
        "person",
        &upstream_config(),
        &RetryPolicy::default(),
    )
    .await
    .expect("structured success");

    assert_eq!(success.attempts, 1);

    let bodies = exchange.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["temperature"], json!(0.7));
    let retry_temperature = bodies[1]["temperature"].as_f64().expect("retry temperature");
    assert!((retry_temperature - 0.5).abs() < 1e-9);
    assert!(!first_system_content(&bodies[0]).contains("Just the raw JSON object"));
    assert!(first_system_content(&bodies[1]).contains("Just the raw JSON object"));
}

#[tokio::test]
async fn exhaustion_reports_last_error_and_content_preview() {
    let exchange = StubExchange::new(vec![
        StubExchange::success("no json here"),
        StubExchange::success("still no json"),
        StubExchange::success("{\"name\": \"Alice\", \"age\": \"thirty\"}"),
    ]);

    let error = run_structured_exchange(
        &exchange,
        "sk-test",
        None,
        &request(None),
        &person_schema(),
        "person",
        &upstream_config(),
        &RetryPolicy::default(),
    )
    .await
    .expect_err("all attempts fail");

    let StructuredRunError::Exhausted(failure) = error else {
        panic!("expected exhaustion, got {error:?}");
    };
    assert_eq!(failure.attempts, 3);
    assert!(failure.last_error.contains("age"));
    assert!(failure.content_preview.contains("thirty"));
    assert_eq!(exchange.bodies().len(), 3);
}

#[tokio::test]
async fn upstream_status_errors_are_relayed_without_retry() {
    let exchange = StubExchange::new(vec![Ok(UpstreamReply::Error {
        status: 429,
        body: "{\"error\": \"rate limited\"}".to_string(),
    })]);

    let error = run_structured_exchange(
        &exchange,
        "sk-test",
        None,
        &request(None),
        &person_schema(),
        "person",
        &upstream_config(),
        &RetryPolicy::default(),
    )
    .await
    .expect_err("upstream error");

    let StructuredRunError::Upstream { status, body } = error else {
        panic!("expected upstream relay, got {error:?}");
    };
    assert_eq!(status, 429);
    assert!(body.contains("rate limited"));
    assert_eq!(exchange.bodies().len(), 1);
}

#[tokio::test]
async fn transport_failures_abort_the_loop() {
    let exchange = StubExchange::new(vec![Err(UpstreamError::Timeout)]);

    let error = run_structured_exchange(
        &exchange,
        "sk-test",
        None,
        &request(None),
        &person_schema(),
        "person",
        &upstream_config(),
        &RetryPolicy::default(),
    )
    .await
    .expect_err("transport error");

    assert!(matches!(
        error,
        StructuredRunError::Transport(UpstreamError::Timeout)
    ));
}
