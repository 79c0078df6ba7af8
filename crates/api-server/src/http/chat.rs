use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use shared::llm::{
    ExtractedCall, OverlayStrength, RetryPolicy, StreamMode, StreamTelemetry, StructuredRunError,
    UpstreamError, UpstreamExchange, UpstreamReply, UpstreamStreamReply, apply_schema_overlay,
    apply_tool_overlay, build_upstream_body, check_schema_shape, message_content,
    parse_function_calls, reassemble_sse, run_structured_exchange,
};
use shared::models::{ChatCompletionRequest, ChatMessage};
use shared::telemetry::{RecordMetadata, TelemetryRecord};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::AppState;
use super::errors::{
    bad_gateway_response, bad_request_response, bad_request_with_details, gateway_timeout_response,
    relay_upstream_error, unauthorized_response,
};

const CHAT_ENDPOINT: &str = "/v1/chat/completions";
const DEFAULT_SCHEMA_NAME: &str = "structured_output";

pub(super) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();

    let Some(bearer_token) = bearer_token(&headers) else {
        return unauthorized_response(
            "API key required. Please provide a valid API key in the Authorization header.",
        );
    };

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let message = format!("Invalid JSON in request body: {err}");
            warn!(error = %err, "rejecting malformed request body");
            record_error(
                &state,
                Value::Null,
                base_metadata(&state, None, false, &headers),
                started_at,
                400,
                json!({"message": message, "type": "json_decode_error"}),
            );
            return bad_request_response("invalid_request_body", &message);
        }
    };

    let request_snapshot: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let mut metadata = base_metadata(&state, request.model.as_deref(), request.stream, &headers);

    debug!(
        original_model = %metadata.original_model,
        mapped_model = %metadata.mapped_model,
        streaming = request.stream,
        "handling chat completion"
    );

    // Schema emulation wins over tools when both are present.
    if let Some((schema, schema_name)) = structured_request(&request) {
        if let Err(err) = check_schema_shape(schema.as_ref()) {
            let message =
                format!("Invalid schema for response_format '{schema_name}': {err}");
            record_error(
                &state,
                request_snapshot,
                metadata,
                started_at,
                400,
                json!({"message": message, "type": "invalid_schema"}),
            );
            return bad_request_response("invalid_schema", &message);
        }
        let schema = schema.unwrap_or(Value::Null);
        metadata.structured_emulation = true;
        metadata.schema_name = Some(schema_name.clone());

        if request.stream {
            let messages = apply_schema_overlay(
                &request.messages,
                &schema,
                &schema_name,
                OverlayStrength::Initial,
            );
            let mode = StreamMode::Structured { schema, schema_name };
            return streamed_response(
                &state,
                &bearer_token,
                &request,
                &messages,
                mode,
                metadata,
                request_snapshot,
                started_at,
            )
            .await;
        }
        return structured_completion(
            &state,
            &bearer_token,
            &request,
            &schema,
            &schema_name,
            metadata,
            request_snapshot,
            started_at,
        )
        .await;
    }

    if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
        metadata.tool_emulation = true;
        let tool_choice = request.tool_choice.clone().unwrap_or_default();
        let messages = apply_tool_overlay(&request.messages, tools, &tool_choice);

        if request.stream {
            return streamed_response(
                &state,
                &bearer_token,
                &request,
                &messages,
                StreamMode::ToolCalls,
                metadata,
                request_snapshot,
                started_at,
            )
            .await;
        }
        return tool_completion(
            &state,
            &bearer_token,
            &request,
            &messages,
            metadata,
            request_snapshot,
            started_at,
        )
        .await;
    }

    if request.stream {
        return streamed_response(
            &state,
            &bearer_token,
            &request,
            &request.messages,
            StreamMode::Passthrough,
            metadata,
            request_snapshot,
            started_at,
        )
        .await;
    }
    plain_completion(
        &state,
        &bearer_token,
        &request,
        metadata,
        request_snapshot,
        started_at,
    )
    .await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn base_metadata(
    state: &AppState,
    original_model: Option<&str>,
    is_streaming: bool,
    headers: &HeaderMap,
) -> RecordMetadata {
    RecordMetadata {
        original_model: original_model.unwrap_or("not specified").to_string(),
        mapped_model: state.config.upstream.model.clone(),
        endpoint: CHAT_ENDPOINT.to_string(),
        is_streaming,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        ..RecordMetadata::default()
    }
}

/// Schema name defaults when the caller names nothing; a missing schema body
/// still goes through shape checking so it fails with a precise error.
fn structured_request(request: &ChatCompletionRequest) -> Option<(Option<Value>, String)> {
    let format = request.response_format.as_ref()?;
    if format.kind != "json_schema" {
        return None;
    }
    let config = format.json_schema.as_ref();
    let schema = config.and_then(|config| config.schema.clone());
    let name = config
        .and_then(|config| config.name.clone())
        .unwrap_or_else(|| DEFAULT_SCHEMA_NAME.to_string());
    Some((schema, name))
}

/// Mirrors the transformed upstream body into the telemetry snapshot so the
/// record shows both what the caller sent and what emulation sent upstream.
fn with_upstream_content(mut snapshot: Value, upstream_body: &Value) -> Value {
    if let Value::Object(map) = &mut snapshot {
        map.insert("_upstream_content".to_string(), upstream_body.clone());
    }
    snapshot
}

fn response_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..8])
}

fn record_outcome(
    state: &AppState,
    request_snapshot: Value,
    response_snapshot: Value,
    mut metadata: RecordMetadata,
    started_at: Instant,
    status_code: u16,
) {
    metadata.latency_ms = started_at.elapsed().as_millis() as u64;
    metadata.status_code = status_code;
    state.sink.record(TelemetryRecord::new(
        request_snapshot,
        response_snapshot,
        metadata,
    ));
}

fn record_error(
    state: &AppState,
    request_snapshot: Value,
    mut metadata: RecordMetadata,
    started_at: Instant,
    status_code: u16,
    error: Value,
) {
    metadata.error = Some(error);
    record_outcome(
        state,
        request_snapshot,
        Value::Null,
        metadata,
        started_at,
        status_code,
    );
}

fn transport_error_response(err: &UpstreamError) -> Response {
    match err {
        UpstreamError::Timeout => {
            error!("request to upstream service timed out");
            gateway_timeout_response()
        }
        other => {
            error!(error = %other, "upstream request failed");
            bad_gateway_response(&other.to_string())
        }
    }
}

async fn structured_completion(
    state: &AppState,
    bearer_token: &str,
    request: &ChatCompletionRequest,
    schema: &Value,
    schema_name: &str,
    mut metadata: RecordMetadata,
    request_snapshot: Value,
    started_at: Instant,
) -> Response {
    let overlay_messages =
        apply_schema_overlay(&request.messages, schema, schema_name, OverlayStrength::Initial);
    let upstream_preview =
        build_upstream_body(request, &overlay_messages, &state.config.upstream, None);
    let request_snapshot = with_upstream_content(request_snapshot, &upstream_preview);

    let policy = RetryPolicy::with_max_attempts(state.config.structured_max_attempts);
    let outcome = run_structured_exchange(
        &state.upstream,
        bearer_token,
        metadata.user_agent.as_deref(),
        request,
        schema,
        schema_name,
        &state.config.upstream,
        &policy,
    )
    .await;

    match outcome {
        Ok(success) => {
            metadata.structured_output_valid = Some(true);
            metadata.attempt_count = success.attempts + 1;
            let response_body = structured_response(
                &success.json.to_string(),
                &success.upstream_response,
                &state.config.upstream.model,
            );
            record_outcome(
                state,
                request_snapshot,
                response_body.clone(),
                metadata,
                started_at,
                200,
            );
            (StatusCode::OK, Json(response_body)).into_response()
        }
        Err(StructuredRunError::Upstream { status, body }) => {
            error!(status, "upstream error during structured exchange");
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"status_code": status, "message": body, "type": "upstream_api_error"}),
            );
            relay_upstream_error(status, body)
        }
        Err(StructuredRunError::Transport(err)) => {
            let status = if matches!(err, UpstreamError::Timeout) { 504 } else { 502 };
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"message": err.to_string(), "type": "transport_error"}),
            );
            transport_error_response(&err)
        }
        Err(StructuredRunError::Exhausted(failure)) => {
            metadata.structured_output_valid = Some(false);
            metadata.attempt_count = failure.attempts;
            let message = format!(
                "Structured output validation failed after {} attempts: {}",
                failure.attempts, failure.last_error
            );
            let details = json!({
                "attempts": failure.attempts,
                "last_error": failure.last_error,
                "content_preview": failure.content_preview,
            });
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                400,
                json!({"message": message, "type": "structured_output_validation_error"}),
            );
            bad_request_with_details(
                "invalid_structured_output",
                &message,
                Some(schema_name.to_string()),
                details,
            )
        }
    }
}

/// Structured result rendered as a standard single-choice completion with
/// the upstream's own identifiers and usage carried over.
fn structured_response(json_content: &str, upstream: &Value, default_model: &str) -> Value {
    json!({
        "id": upstream.get("id").cloned().unwrap_or_else(|| json!(response_id())),
        "object": "chat.completion",
        "created": upstream
            .get("created")
            .cloned()
            .unwrap_or_else(|| json!(chrono::Utc::now().timestamp())),
        "model": upstream.get("model").cloned().unwrap_or_else(|| json!(default_model)),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": json_content},
            "logprobs": null,
            "finish_reason": "stop"
        }],
        "usage": upstream.get("usage").cloned().unwrap_or_else(|| json!({
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0
        })),
        "system_fingerprint": upstream.get("system_fingerprint").cloned().unwrap_or(Value::Null),
    })
}

async fn tool_completion(
    state: &AppState,
    bearer_token: &str,
    request: &ChatCompletionRequest,
    messages: &[ChatMessage],
    mut metadata: RecordMetadata,
    request_snapshot: Value,
    started_at: Instant,
) -> Response {
    let body = build_upstream_body(request, messages, &state.config.upstream, None);
    let request_snapshot = with_upstream_content(request_snapshot, &body);
    match state
        .upstream
        .send(bearer_token, metadata.user_agent.as_deref(), body)
        .await
    {
        Ok(UpstreamReply::Success(response)) => {
            let content = message_content(&response).to_string();
            let extracted = parse_function_calls(&content);
            metadata.function_calls_detected = extracted.calls.len();

            let response_body = if extracted.calls.is_empty() {
                debug!("no function calls detected, returning normal response");
                response
            } else {
                debug!(calls = extracted.calls.len(), "detected function calls");
                function_call_response(&extracted.calls, &response)
            };
            record_outcome(
                state,
                request_snapshot,
                response_body.clone(),
                metadata,
                started_at,
                200,
            );
            (StatusCode::OK, Json(response_body)).into_response()
        }
        Ok(UpstreamReply::Error { status, body }) => {
            error!(status, "upstream error during tool exchange");
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"status_code": status, "message": body, "type": "upstream_api_error"}),
            );
            relay_upstream_error(status, body)
        }
        Err(err) => {
            let status = if matches!(err, UpstreamError::Timeout) { 504 } else { 502 };
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"message": err.to_string(), "type": "transport_error"}),
            );
            transport_error_response(&err)
        }
    }
}

/// One choice per extracted call, each carrying a single tool call entry.
fn function_call_response(calls: &[ExtractedCall], upstream: &Value) -> Value {
    let choices: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": call.call_id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments}
                    }]
                },
                "logprobs": null,
                "finish_reason": "tool_calls"
            })
        })
        .collect();

    json!({
        "id": upstream.get("id").cloned().unwrap_or_else(|| json!(response_id())),
        "object": "chat.completion",
        "created": upstream.get("created").cloned().unwrap_or(Value::Null),
        "model": upstream.get("model").cloned().unwrap_or(Value::Null),
        "choices": choices,
        "usage": upstream.get("usage").cloned().unwrap_or(Value::Null),
        "system_fingerprint": upstream.get("system_fingerprint").cloned().unwrap_or(Value::Null),
    })
}

async fn plain_completion(
    state: &AppState,
    bearer_token: &str,
    request: &ChatCompletionRequest,
    metadata: RecordMetadata,
    request_snapshot: Value,
    started_at: Instant,
) -> Response {
    let body = build_upstream_body(request, &request.messages, &state.config.upstream, None);
    match state
        .upstream
        .send(bearer_token, metadata.user_agent.as_deref(), body)
        .await
    {
        Ok(UpstreamReply::Success(response)) => {
            record_outcome(
                state,
                request_snapshot,
                response.clone(),
                metadata,
                started_at,
                200,
            );
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(UpstreamReply::Error { status, body }) => {
            error!(status, "upstream error during passthrough exchange");
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"status_code": status, "message": body, "type": "upstream_api_error"}),
            );
            relay_upstream_error(status, body)
        }
        Err(err) => {
            let status = if matches!(err, UpstreamError::Timeout) { 504 } else { 502 };
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"message": err.to_string(), "type": "transport_error"}),
            );
            transport_error_response(&err)
        }
    }
}

async fn streamed_response(
    state: &AppState,
    bearer_token: &str,
    request: &ChatCompletionRequest,
    messages: &[ChatMessage],
    mode: StreamMode,
    mut metadata: RecordMetadata,
    request_snapshot: Value,
    started_at: Instant,
) -> Response {
    let body = build_upstream_body(request, messages, &state.config.upstream, None);
    let request_snapshot = if matches!(mode, StreamMode::Passthrough) {
        request_snapshot
    } else {
        with_upstream_content(request_snapshot, &body)
    };
    match state
        .upstream
        .send_stream(bearer_token, metadata.user_agent.as_deref(), body)
        .await
    {
        Ok(UpstreamStreamReply::Stream(response)) => {
            metadata.status_code = 200;
            let telemetry = StreamTelemetry {
                sink: state.sink.clone(),
                request_snapshot,
                metadata,
                started_at,
            };
            let events = reassemble_sse(
                response.bytes_stream(),
                mode,
                state.config.upstream.model.clone(),
                telemetry,
            );
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(events),
            )
                .into_response()
        }
        Ok(UpstreamStreamReply::Error { status, body }) => {
            error!(status, "upstream error before stream start");
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"status_code": status, "message": body, "type": "upstream_api_error"}),
            );
            relay_upstream_error(status, body)
        }
        Err(err) => {
            let status = if matches!(err, UpstreamError::Timeout) { 504 } else { 502 };
            record_error(
                state,
                request_snapshot,
                metadata,
                started_at,
                status,
                json!({"message": err.to_string(), "type": "transport_error"}),
            );
            transport_error_response(&err)
        }
    }
}
