//! Error types for the detection core
//!
//! Configuration, storage and CLI code use `anyhow`; the brand detection
//! pipeline keeps typed errors so the orchestrator can decide which failures
//! are recoverable.

use std::time::Duration;

/// Errors surfaced to callers of the hybrid brand detector
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// Image bytes were supplied but could not be decoded at all
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),

    /// The blocking detection task was cancelled or panicked
    #[error("detection task failed: {0}")]
    TaskFailed(String),
}

/// Errors produced by an image encoder implementation
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Model file missing or runtime could not be initialized
    #[error("encoder model unavailable: {0}")]
    Unavailable(String),

    /// Inference ran but failed
    #[error("encoding failed: {0}")]
    Failed(String),
}

/// Errors from the visual similarity stage
///
/// Both variants are recoverable: the orchestrator treats them as
/// "no visual candidates".
#[derive(Debug, thiserror::Error)]
pub enum VisualError {
    #[error("vision encoder unavailable: {0}")]
    ModelUnavailable(String),

    #[error("vision encoder timed out after {0:?}")]
    Timeout(Duration),
}

impl From<EncodeError> for VisualError {
    fn from(err: EncodeError) -> Self {
        VisualError::ModelUnavailable(err.to_string())
    }
}

/// Errors from the on-disk embedding cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Entry exists but cannot be trusted; callers treat this as a miss
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
