//! Error types for shardstream
//!
//! Configuration errors are fatal and surface at pipeline construction.
//! Record errors are recovered where they are detected: logged, skipped,
//! and never propagated past the stage that saw them.

use thiserror::Error;

/// Primary error type for all pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    // ========== Configuration Errors ==========

    /// Shard pattern expanded to nothing
    #[error("Shard pattern matched no shards: {pattern}")]
    EmptyShardPattern { pattern: String },

    /// Shard pattern could not be parsed
    #[error("Invalid shard pattern {pattern}: {reason}")]
    InvalidShardPattern { pattern: String, reason: String },

    /// Neither a size hint nor sidecar metadata is available
    #[error(
        "Number of samples is unknown for {pattern}: supply a total samples hint \
         or place sizes.json / __len__ next to the shards"
    )]
    MissingSampleCount { pattern: String },

    /// Sidecar metadata exists but is unreadable
    #[error("Invalid size metadata at {path}: {reason}")]
    InvalidSizeMetadata { path: String, reason: String },

    /// Not enough shards to give every worker at least one
    #[error("Number of shards ({num_shards}) must be >= total workers ({required})")]
    InsufficientShards { num_shards: usize, required: usize },

    /// Unknown dataset kind
    #[error("Unsupported dataset kind: {kind}")]
    UnsupportedDatasetKind { kind: String },

    /// Any other invalid setting
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Record Errors ==========

    /// Shard could not be fetched
    #[error("Failed to fetch shard {shard}: {message}")]
    ShardFetch { shard: String, message: String },

    /// Shard does not exist
    #[error("Shard not found: {shard}")]
    ShardNotFound { shard: String },

    /// Archive could not be read or decompressed
    #[error("Archive error in {shard}: {message}")]
    Archive { shard: String, message: String },

    /// Payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Tokenizer failed on an input
    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },

    // ========== Runtime Errors ==========

    /// I/O runtime could not be created
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Returns true if this error must abort pipeline construction
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyShardPattern { .. }
                | PipelineError::InvalidShardPattern { .. }
                | PipelineError::MissingSampleCount { .. }
                | PipelineError::InvalidSizeMetadata { .. }
                | PipelineError::InsufficientShards { .. }
                | PipelineError::UnsupportedDatasetKind { .. }
                | PipelineError::InvalidConfig { .. }
        )
    }

    /// Returns true if this error is handled by skipping the offending input
    pub fn is_record(&self) -> bool {
        matches!(
            self,
            PipelineError::ShardFetch { .. }
                | PipelineError::ShardNotFound { .. }
                | PipelineError::Archive { .. }
                | PipelineError::Decode(_)
                | PipelineError::Tokenizer { .. }
        )
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        PipelineError::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Malformed payload inside an otherwise readable record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Image decode failed: {0}")]
    Image(String),

    #[error("Base64 decode failed: {0}")]
    Base64(String),

    #[error("Payload is not valid UTF-8")]
    Utf8,

    #[error("JSON decode failed: {0}")]
    Json(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = PipelineError::EmptyShardPattern {
            pattern: "shard-{000..001}.tar".into(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_record());

        let err = PipelineError::from(DecodeError::Utf8);
        assert!(err.is_record());
        assert!(!err.is_configuration());
    }
}
