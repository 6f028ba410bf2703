//! Error types for DSP operations.

use thiserror::Error;

/// Errors that can occur during DSP operations.
#[derive(Debug, Error)]
pub enum DspError {
    /// Transform length must be at least one sample.
    #[error("invalid transform length: {0}")]
    InvalidLength(usize),

    /// Input length mismatch.
    #[error("input length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// The underlying transform failed.
    #[error("transform failed: {0}")]
    TransformFailed(String),
}

/// Result type for DSP operations.
pub type DspResult<T> = Result<T, DspError>;
