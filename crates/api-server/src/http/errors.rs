use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use shared::models::{ErrorBody, ErrorResponse};

pub(super) fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("unauthorized", message)),
    )
        .into_response()
}

pub(super) fn bad_request_response(code: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(code, message)),
    )
        .into_response()
}

pub(super) fn bad_request_with_details(
    code: &str,
    message: &str,
    param: Option<String>,
    details: Value,
) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                param,
                details: Some(details),
            },
        }),
    )
        .into_response()
}

pub(super) fn bad_gateway_response(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse::new("upstream_unreachable", message)),
    )
        .into_response()
}

pub(super) fn gateway_timeout_response() -> Response {
    (
        StatusCode::GATEWAY_TIMEOUT,
        Json(ErrorResponse::new(
            "upstream_timeout",
            "Request to upstream service timed out",
        )),
    )
        .into_response()
}

/// Non-success upstream bodies are relayed byte for byte with the original
/// status so callers see exactly what the provider said.
pub(super) fn relay_upstream_error(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
