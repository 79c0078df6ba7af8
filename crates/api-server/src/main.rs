use std::net::SocketAddr;
use std::sync::Arc;

use shared::config::GatewayConfig;
use shared::llm::UpstreamClient;
use shared::telemetry::{RestDocumentStore, TelemetrySink};
use tracing::{error, info, warn};

mod http;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "api_server=info,axum=info".to_string()),
        )
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load gateway config");
            std::process::exit(1);
        }
    };

    let upstream = match UpstreamClient::new(config.upstream.clone()) {
        Ok(upstream) => upstream,
        Err(err) => {
            error!(error = %err, "failed to initialize upstream client");
            std::process::exit(1);
        }
    };

    let sink = match &config.telemetry.store_url {
        Some(store_url) => match RestDocumentStore::new(store_url.clone()) {
            Ok(store) => TelemetrySink::spawn(Arc::new(store), config.telemetry.clone()),
            Err(err) => {
                warn!(error = %err, "telemetry store unavailable, running without telemetry");
                TelemetrySink::disabled()
            }
        },
        None => {
            warn!("TELEMETRY_STORE_URL not set, running without telemetry");
            TelemetrySink::disabled()
        }
    };

    let app = http::build_router(http::AppState {
        config: config.clone(),
        upstream,
        sink,
    });

    let addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, bind_addr = %config.bind_addr, "invalid bind addr");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, bind_addr = %addr, "failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    info!(
        bind_addr = %listener.local_addr().unwrap_or(addr),
        upstream = %config.upstream.chat_completions_url,
        mapped_model = %config.upstream.model,
        "gateway listening"
    );

    if let Err(err) = axum::serve(listener, app.into_make_service()).await {
        error!(error = %err, "gateway server failed");
        std::process::exit(1);
    }
}
