use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub type PutFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Request(String),
    #[error("document store returned status {0}")]
    Status(u16),
}

/// The only capability the gateway needs from the telemetry backend: write
/// one document into a collection. The concrete store is an external
/// collaborator behind this seam.
pub trait DocumentStore: Send + Sync {
    fn put<'a>(&'a self, collection: &'a str, id: &'a str, document: Value) -> PutFuture<'a>;
}

const STORE_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Minimal REST-shaped store: PUT `{base_url}/{collection}/{id}` with the
/// document as the JSON body.
#[derive(Clone)]
pub struct RestDocumentStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum StoreBuildError {
    #[error("failed to build document store http client: {0}")]
    HttpClient(String),
}

impl RestDocumentStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreBuildError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(STORE_HTTP_TIMEOUT_MS))
            .build()
            .map_err(|err| StoreBuildError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl DocumentStore for RestDocumentStore {
    fn put<'a>(&'a self, collection: &'a str, id: &'a str, document: Value) -> PutFuture<'a> {
        Box::pin(async move {
            let url = format!("{}/{collection}/{id}", self.base_url);
            let response = self
                .client
                .put(&url)
                .json(&document)
                .send()
                .await
                .map_err(|err| StoreError::Request(err.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(StoreError::Status(status.as_u16()));
            }
            Ok(())
        })
    }
}
