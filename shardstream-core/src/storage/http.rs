//! HTTP(S) shard client
//!
//! Plain GETs through a pooled reqwest client. No retries: a failed request
//! is reported once and the shard is skipped upstream.

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::StorageConfig;
use crate::error::{PipelineError, Result};

/// HTTP client for remote shards
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a client with the configured timeouts
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Runtime {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    /// Fetch the full body at `url`
    pub async fn get(&self, url: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::ShardFetch {
                shard: url.into(),
                message: e.to_string(),
            })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::ShardNotFound { shard: url.into() });
        }

        if !resp.status().is_success() {
            return Err(PipelineError::ShardFetch {
                shard: url.into(),
                message: format!("status {}", resp.status()),
            });
        }

        let data = resp.bytes().await.map_err(|e| PipelineError::ShardFetch {
            shard: url.into(),
            message: format!("failed to read body: {}", e),
        })?;

        debug!("GET {} ({} bytes)", url, data.len());
        Ok(data)
    }
}
