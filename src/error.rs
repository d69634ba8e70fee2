//! Error types for the donut pipeline
//!
//! Provides a unified error type for all pipeline operations.

use thiserror::Error;

/// Result type alias for donut pipeline operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for the donut pipeline
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // ===== Parameter Errors =====
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    // ===== Upstream (caller source) Errors =====
    #[error("upstream read failed: {0}")]
    UpstreamRead(String),

    // ===== Node Errors =====
    #[error("node {node_index} write failed: {message}")]
    NodeWrite { node_index: usize, message: String },

    #[error("node {node_index} read failed: {message}")]
    NodeRead { node_index: usize, message: String },

    // ===== Durability / Shard-count Errors =====
    #[error("insufficient durability: {succeeded} of {required} node sinks closed")]
    InsufficientDurability { succeeded: usize, required: usize },

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    // ===== Envelope Errors =====
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    // ===== Codec Errors =====
    #[error("shard length mismatch: expected {expected}, got {actual}")]
    ShardLengthMismatch { expected: usize, actual: usize },

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    // ===== Lifecycle Errors =====
    #[error("canceled: {0}")]
    Canceled(String),
}

impl From<reed_solomon_erasure::Error> for CoreError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        CoreError::DecodeFailure(err.to_string())
    }
}
