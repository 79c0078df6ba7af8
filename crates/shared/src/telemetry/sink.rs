use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{sleep, timeout};

use crate::config::TelemetryConfig;

use super::breaker::{BreakerSettings, SinkHealth};
use super::sanitize::sanitize_payload;
use super::store::DocumentStore;
use super::{TelemetryRecord, collection_for};

/// Fire-and-forget handle held by request handlers. Records are queued on a
/// bounded channel and persisted by background workers; a full queue or an
/// open breaker drops the record, never the response.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: Option<mpsc::Sender<TelemetryRecord>>,
}

impl TelemetrySink {
    /// Sink with no backing store. `record` becomes a no-op.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Starts the dispatcher and hands back the sending half. The dispatcher
    /// stops once every sink clone is dropped and the queue drains.
    pub fn spawn(store: Arc<dyn DocumentStore>, config: TelemetryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        tokio::spawn(run_dispatcher(store, config, rx));
        Self { tx: Some(tx) }
    }

    pub fn record(&self, record: TelemetryRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(record) {
            tracing::warn!(error = %err, "telemetry queue full, dropping record");
        }
    }
}

struct SinkShared {
    store: Arc<dyn DocumentStore>,
    config: TelemetryConfig,
    health: Mutex<SinkHealth>,
}

impl SinkShared {
    fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.config.breaker_failure_threshold,
            idle_reset_window: Duration::from_secs(self.config.breaker_idle_reset_seconds),
        }
    }

    fn breaker_allows(&self) -> bool {
        let settings = self.breaker_settings();
        let mut health = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        health.allow_attempt(Instant::now(), &settings)
    }

    fn note_outcome(&self, succeeded: bool) {
        let mut health = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if succeeded {
            health.record_success();
        } else {
            health.record_failure(Instant::now());
        }
    }
}

async fn run_dispatcher(
    store: Arc<dyn DocumentStore>,
    config: TelemetryConfig,
    mut rx: mpsc::Receiver<TelemetryRecord>,
) {
    let workers = Arc::new(Semaphore::new(config.workers));
    let shared = Arc::new(SinkShared {
        store,
        config,
        health: Mutex::new(SinkHealth::default()),
    });

    while let Some(record) = rx.recv().await {
        let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
            break;
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            persist_record(&shared, record).await;
            drop(permit);
        });
    }
}

async fn persist_record(shared: &SinkShared, record: TelemetryRecord) {
    if !shared.breaker_allows() {
        tracing::debug!(
            correlation_id = %record.correlation_id,
            "telemetry breaker open, dropping record"
        );
        return;
    }

    let collection = collection_for(record.timestamp);
    let id = record.correlation_id.clone();
    let document = sanitized_document(&record);

    let put_timeout = Duration::from_millis(shared.config.put_timeout_ms);
    let outcome = timeout(put_timeout, put_with_retry(shared, &collection, &id, document)).await;

    let succeeded = matches!(outcome, Ok(true));
    shared.note_outcome(succeeded);
    if !succeeded {
        tracing::warn!(correlation_id = %id, collection = %collection, "telemetry record not persisted");
    }
}

fn sanitized_document(record: &TelemetryRecord) -> Value {
    let mut document = serde_json::json!({
        "correlation_id": record.correlation_id,
        "timestamp": record.timestamp.to_rfc3339(),
        "request": sanitize_payload(&record.request),
        "response": sanitize_payload(&record.response),
    });
    if let Ok(metadata) = serde_json::to_value(&record.metadata)
        && let Some(object) = document.as_object_mut()
    {
        object.insert("metadata".to_string(), metadata);
    }
    document
}

async fn put_with_retry(shared: &SinkShared, collection: &str, id: &str, document: Value) -> bool {
    let attempts = shared.config.put_attempts.max(1);
    for attempt in 0..attempts {
        match shared.store.put(collection, id, document.clone()).await {
            Ok(()) => return true,
            Err(err) => {
                tracing::debug!(
                    attempt = attempt + 1,
                    attempts,
                    error = %err,
                    "telemetry put failed"
                );
                if attempt + 1 < attempts {
                    let backoff = shared.config.retry_base_backoff_ms << attempt;
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
    false
}
