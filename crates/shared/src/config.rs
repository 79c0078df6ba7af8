use thiserror::Error;

use crate::config_env::{optional_trimmed_env, parse_u32_env, parse_u64_env, parse_usize_env};

const DEFAULT_UPSTREAM_CHAT_COMPLETIONS_URL: &str =
    "https://api.upstage.ai/v1/chat/completions";
const DEFAULT_UPSTREAM_MODEL: &str = "solar-pro2-preview";
const DEFAULT_REASONING_EFFORT: &str = "high";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

const DEFAULT_STRUCTURED_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_TELEMETRY_QUEUE_CAPACITY: usize = 256;
const DEFAULT_TELEMETRY_WORKERS: usize = 2;
const DEFAULT_TELEMETRY_PUT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TELEMETRY_PUT_ATTEMPTS: u32 = 3;
const DEFAULT_TELEMETRY_RETRY_BASE_BACKOFF_MS: u64 = 500;
const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_IDLE_RESET_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub chat_completions_url: String,
    pub model: String,
    pub reasoning_effort: String,
    pub request_timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let chat_completions_url = optional_trimmed_env("UPSTREAM_CHAT_COMPLETIONS_URL")
            .unwrap_or_else(|| DEFAULT_UPSTREAM_CHAT_COMPLETIONS_URL.to_string());
        if !chat_completions_url.starts_with("http://")
            && !chat_completions_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidConfiguration(
                "UPSTREAM_CHAT_COMPLETIONS_URL must start with http:// or https://".to_string(),
            ));
        }

        Ok(Self {
            chat_completions_url,
            model: optional_trimmed_env("UPSTREAM_MODEL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_MODEL.to_string()),
            reasoning_effort: optional_trimmed_env("UPSTREAM_REASONING_EFFORT")
                .unwrap_or_else(|| DEFAULT_REASONING_EFFORT.to_string()),
            request_timeout_ms: parse_u64_env(
                "UPSTREAM_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?,
        })
    }
}

/// Sink settings. `store_url` absent disables persistence entirely; the sink
/// still accepts records and drops them.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub store_url: Option<String>,
    pub queue_capacity: usize,
    pub workers: usize,
    pub put_timeout_ms: u64,
    pub put_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_idle_reset_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            queue_capacity: DEFAULT_TELEMETRY_QUEUE_CAPACITY,
            workers: DEFAULT_TELEMETRY_WORKERS,
            put_timeout_ms: DEFAULT_TELEMETRY_PUT_TIMEOUT_MS,
            put_attempts: DEFAULT_TELEMETRY_PUT_ATTEMPTS,
            retry_base_backoff_ms: DEFAULT_TELEMETRY_RETRY_BASE_BACKOFF_MS,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_idle_reset_seconds: DEFAULT_BREAKER_IDLE_RESET_SECONDS,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            store_url: optional_trimmed_env("TELEMETRY_STORE_URL"),
            queue_capacity: parse_usize_env(
                "TELEMETRY_QUEUE_CAPACITY",
                DEFAULT_TELEMETRY_QUEUE_CAPACITY,
            )?,
            workers: parse_usize_env("TELEMETRY_WORKERS", DEFAULT_TELEMETRY_WORKERS)?,
            put_timeout_ms: parse_u64_env(
                "TELEMETRY_PUT_TIMEOUT_MS",
                DEFAULT_TELEMETRY_PUT_TIMEOUT_MS,
            )?,
            put_attempts: parse_u32_env("TELEMETRY_PUT_ATTEMPTS", DEFAULT_TELEMETRY_PUT_ATTEMPTS)?,
            retry_base_backoff_ms: parse_u64_env(
                "TELEMETRY_RETRY_BASE_BACKOFF_MS",
                DEFAULT_TELEMETRY_RETRY_BASE_BACKOFF_MS,
            )?,
            breaker_failure_threshold: parse_u32_env(
                "TELEMETRY_BREAKER_FAILURE_THRESHOLD",
                DEFAULT_BREAKER_FAILURE_THRESHOLD,
            )?,
            breaker_idle_reset_seconds: parse_u64_env(
                "TELEMETRY_BREAKER_IDLE_RESET_SECONDS",
                DEFAULT_BREAKER_IDLE_RESET_SECONDS,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub upstream: UpstreamConfig,
    pub structured_max_attempts: u32,
    pub telemetry: TelemetryConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: optional_trimmed_env("API_BIND_ADDR")
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            upstream: UpstreamConfig::from_env()?,
            structured_max_attempts: parse_u32_env(
                "STRUCTURED_MAX_ATTEMPTS",
                DEFAULT_STRUCTURED_MAX_ATTEMPTS,
            )?,
            telemetry: TelemetryConfig::from_env()?,
        })
    }
}
