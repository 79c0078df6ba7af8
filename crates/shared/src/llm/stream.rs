use std::convert::Infallible;
use std::fmt::Display;
use std::time::Instant;

use futures_util::{Stream, StreamExt, pin_mut};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::models::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkToolCall, ToolCallFunction,
};
use crate::telemetry::{RecordMetadata, TelemetryRecord, TelemetrySink};

use super::extract::{extract_json_from_text, parse_function_calls};
use super::validate::validate_against_schema;

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE: &str = "[DONE]";
/// Content prefixes that mark the start of an emulated call literal. Once one
/// appears in the accumulated text, no further deltas reach the caller.
const CALL_CUES: [&str; 2] = ["[{", "{\"type\""];

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// How the reassembler treats the upstream token stream.
#[derive(Debug, Clone)]
pub enum StreamMode {
    /// Forward every event as it arrives.
    Passthrough,
    /// Forward prose, suppress call literals, synthesize tool-call chunks at
    /// end of stream.
    ToolCalls,
    /// Withhold everything; emit one validated document (or one error
    /// message) at end of stream.
    Structured { schema: Value, schema_name: String },
}

/// Context the reassembler needs to flush one telemetry record when the
/// stream ends, including on caller disconnect.
pub struct StreamTelemetry {
    pub sink: TelemetrySink,
    pub request_snapshot: Value,
    pub metadata: RecordMetadata,
    pub started_at: Instant,
}

/// Consumes the upstream byte stream on a background task and yields
/// re-assembled SSE events. The channel is bounded so a slow caller applies
/// backpressure; a dropped caller ends the task after telemetry is flushed.
pub fn reassemble_sse<S, B, E>(
    upstream: S,
    mode: StreamMode,
    model: String,
    telemetry: StreamTelemetry,
) -> ReceiverStream<Result<String, Infallible>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(run_reassembler(upstream, mode, model, telemetry, tx));
    ReceiverStream::new(rx)
}

fn stream_response_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..8])
}

fn synthesized_chunk(
    id: &str,
    model: &str,
    created: i64,
    index: usize,
    delta: ChunkDelta,
    finish_reason: Option<String>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index,
            delta,
            logprobs: None,
            finish_reason,
        }],
    }
}

fn data_event(payload: &str) -> String {
    format!("{SSE_DATA_PREFIX}{payload}\n\n")
}

fn chunk_event(chunk: &ChatCompletionChunk) -> String {
    match serde_json::to_string(chunk) {
        Ok(json) => data_event(&json),
        Err(_) => data_event("{}"),
    }
}

fn error_event(message: &str) -> String {
    let body = serde_json::json!({
        "error": {"code": "upstream_stream_error", "message": message}
    });
    data_event(&body.to_string())
}

fn delta_content(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(ToString::to_string)
}

async fn emit(tx: &mpsc::Sender<Result<String, Infallible>>, event: String) -> bool {
    tx.send(Ok(event)).await.is_ok()
}

async fn run_reassembler<S, B, E>(
    upstream: S,
    mode: StreamMode,
    model: String,
    telemetry: StreamTelemetry,
    tx: mpsc::Sender<Result<String, Infallible>>,
) where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    pin_mut!(upstream);

    let mut pending = String::new();
    let mut accumulated = String::new();
    let mut suppressing = false;
    let mut saw_done = false;
    let mut transport_error: Option<String> = None;

    'outer: while let Some(item) = upstream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(err) => {
                let message = err.to_string();
                let _ = emit(&tx, error_event(&message)).await;
                transport_error = Some(message);
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(bytes.as_ref()));

        while let Some(newline) = pending.find('\n') {
            let line = pending[..newline].trim_end_matches('\r').to_string();
            pending.drain(..=newline);

            let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
                continue;
            };
            if payload == SSE_DONE {
                saw_done = true;
                break 'outer;
            }

            if let Some(content) = delta_content(payload) {
                accumulated.push_str(&content);
            }

            let forward = match &mode {
                StreamMode::Passthrough => true,
                StreamMode::ToolCalls => {
                    if !suppressing && CALL_CUES.iter().any(|cue| accumulated.contains(cue)) {
                        suppressing = true;
                    }
                    !suppressing
                }
                StreamMode::Structured { .. } => false,
            };
            if forward && !emit(&tx, data_event(payload)).await {
                break 'outer;
            }
        }
    }

    let mut calls_detected = 0usize;
    let mut structured_valid: Option<bool> = None;
    let mut final_error: Option<Value> = None;

    if saw_done {
        match &mode {
            StreamMode::Passthrough => {
                let _ = emit(&tx, data_event(SSE_DONE)).await;
            }
            StreamMode::ToolCalls => {
                let extracted = parse_function_calls(&accumulated);
                calls_detected = extracted.calls.len();
                if !extracted.calls.is_empty() {
                    let id = stream_response_id();
                    let created = chrono::Utc::now().timestamp();
                    for (index, call) in extracted.calls.iter().enumerate() {
                        let delta = ChunkDelta {
                            content: None,
                            tool_calls: Some(vec![ChunkToolCall {
                                index,
                                id: call.call_id.clone(),
                                kind: "function".to_string(),
                                function: ToolCallFunction {
                                    name: call.name.clone(),
                                    arguments: call.arguments.clone(),
                                },
                            }]),
                        };
                        let chunk = synthesized_chunk(
                            &id,
                            &model,
                            created,
                            index,
                            delta,
                            Some("tool_calls".to_string()),
                        );
                        if !emit(&tx, chunk_event(&chunk)).await {
                            break;
                        }
                    }
                }
                // Suppressed text that yields no calls is swallowed.
                let _ = emit(&tx, data_event(SSE_DONE)).await;
            }
            StreamMode::Structured { schema, .. } => {
                let outcome = extract_json_from_text(&accumulated)
                    .map_err(|err| err.to_string())
                    .and_then(|value| {
                        validate_against_schema(&value, schema)
                            .map(|()| value)
                            .map_err(|err| err.to_string())
                    });
                let content = match outcome {
                    Ok(json) => {
                        structured_valid = Some(true);
                        json.to_string()
                    }
                    Err(err) => {
                        structured_valid = Some(false);
                        final_error = Some(Value::String(err.clone()));
                        format!("Error: Structured output validation failed: {err}")
                    }
                };
                let chunk = synthesized_chunk(
                    &stream_response_id(),
                    &model,
                    chrono::Utc::now().timestamp(),
                    0,
                    ChunkDelta {
                        content: Some(content),
                        tool_calls: None,
                    },
                    Some("stop".to_string()),
                );
                let _ = emit(&tx, chunk_event(&chunk)).await;
                let _ = emit(&tx, data_event(SSE_DONE)).await;
            }
        }
    }

    let mut metadata = telemetry.metadata;
    metadata.latency_ms = telemetry.started_at.elapsed().as_millis() as u64;
    metadata.function_calls_detected = calls_detected;
    metadata.structured_output_valid = structured_valid;
    if let Some(message) = transport_error {
        metadata.error = Some(Value::String(message));
    } else if metadata.error.is_none() {
        metadata.error = final_error;
    }

    let response_snapshot = serde_json::json!({
        "streamed": true,
        "content": accumulated,
    });
    telemetry.sink.record(TelemetryRecord::new(
        telemetry.request_snapshot,
        response_snapshot,
        metadata,
    ));
}
