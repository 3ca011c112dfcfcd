//! Shard storage
//!
//! Resolves a shard identifier to its bytes: local paths through `tokio::fs`,
//! `http(s)://` URLs through [`HttpClient`].

pub mod http;

pub use http::HttpClient;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;

use crate::data::Shard;
use crate::error::{PipelineError, Result};
use crate::metrics::standard;

/// Configuration for shard fetching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

/// Fetches whole shards from local disk or HTTP
#[derive(Clone)]
pub struct ShardStore {
    http: HttpClient,
}

impl ShardStore {
    /// Create a store
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(config)?,
        })
    }

    /// Read every byte of `shard`
    pub async fn fetch(&self, shard: &Shard) -> Result<Bytes> {
        let _timer = standard::SHARD_FETCH_DURATION.start_timer();

        let data = if shard.is_remote() {
            self.http.get(&shard.url).await?
        } else {
            let path = shard.url.strip_prefix("file://").unwrap_or(&shard.url);
            match tokio::fs::read(path).await {
                Ok(data) => Bytes::from(data),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(PipelineError::ShardNotFound {
                        shard: shard.url.clone(),
                    })
                }
                Err(e) => {
                    return Err(PipelineError::ShardFetch {
                        shard: shard.url.clone(),
                        message: e.to_string(),
                    })
                }
            }
        };

        standard::BYTES_FETCHED.inc_by(data.len() as u64);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        std::fs::write(&path, b"payload").unwrap();

        let store = ShardStore::new(&StorageConfig::default()).unwrap();
        let data = store
            .fetch(&Shard::new(path.display().to_string()))
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_missing_local_shard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.tar");

        let store = ShardStore::new(&StorageConfig::default()).unwrap();
        let err = store
            .fetch(&Shard::new(path.display().to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShardNotFound { .. }));
        assert!(err.is_record());
    }
}
