use axum::Router;
use axum::routing::{get, post};
use shared::config::GatewayConfig;
use shared::llm::UpstreamClient;
use shared::telemetry::TelemetrySink;

mod chat;
mod errors;
mod health;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub upstream: UpstreamClient,
    pub sink: TelemetrySink,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/v1/models", get(health::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/{*path}", axum::routing::any(health::unsupported_v1))
        .with_state(app_state)
}
