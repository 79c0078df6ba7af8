use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub mod breaker;
pub mod sanitize;
pub mod sink;
pub mod store;

pub use breaker::{BreakerSettings, SinkHealth};
pub use sanitize::{REDACTION_MARKER, sanitize_payload};
pub use sink::TelemetrySink;
pub use store::{DocumentStore, RestDocumentStore, StoreError};

/// One sanitized snapshot per exchange, success or failure. Created on the
/// request path, handed to the sink, never read back.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: Value,
    pub response: Value,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordMetadata {
    pub latency_ms: u64,
    pub status_code: u16,
    pub original_model: String,
    pub mapped_model: String,
    pub endpoint: String,
    pub is_streaming: bool,
    pub tool_emulation: bool,
    pub structured_emulation: bool,
    pub function_calls_detected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl TelemetryRecord {
    pub fn new(request: Value, response: Value, metadata: RecordMetadata) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            request,
            response,
            metadata,
        }
    }
}

/// Daily collection partition, one document per exchange.
pub(crate) fn collection_for(timestamp: DateTime<Utc>) -> String {
    format!("proxy_logs_{}", timestamp.format("%Y_%m_%d"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::collection_for;

    #[test]
    fn collections_partition_by_utc_day() {
        let timestamp = chrono::Utc
            .with_ymd_and_hms(2025, 3, 9, 23, 59, 0)
            .single()
            .expect("valid timestamp");
        assert_eq!(collection_for(timestamp), "proxy_logs_2025_03_09");
    }
}
