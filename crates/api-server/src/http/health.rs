use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use shared::models::ErrorResponse;
use tracing::warn;

use super::AppState;

pub(super) async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "LLM gateway",
        "description": "Adapts OpenAI-compatible requests for an upstream provider, emulating function calling and structured output via prompt engineering",
        "model_mapping": format!("All model requests are mapped to: {}", state.config.upstream.model),
        "features": [
            "Model mapping",
            "Streaming & non-streaming responses",
            "Function calling via prompt engineering",
            "Structured output via prompt engineering",
            "OpenAI API compatibility"
        ],
        "endpoints": {
            "chat_completions": "POST /v1/chat/completions",
            "health": "GET /health"
        }
    }))
}

pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "llm-gateway",
        "default_model": state.config.upstream.model,
        "features": [
            "function_calling",
            "structured_output",
            "streaming",
            "model_mapping"
        ],
        "auth_required": true,
        "auth_info": "Clients must provide a Bearer token in the Authorization header"
    }))
}

/// Static compatibility stub; the gateway serves exactly one model.
pub(super) async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.upstream.model,
            "object": "model",
            "created": 1_677_610_602,
            "owned_by": "llm-gateway",
            "permission": [],
            "root": state.config.upstream.model,
            "parent": null
        }]
    }))
}

pub(super) async fn unsupported_v1(Path(path): Path<String>) -> Response {
    warn!(path = %path, "unsupported endpoint requested");
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "unsupported_endpoint",
            format!(
                "Endpoint /v1/{path} is not supported by this proxy. Supported endpoints: /v1/chat/completions, /v1/models"
            ),
        )),
    )
        .into_response()
}
