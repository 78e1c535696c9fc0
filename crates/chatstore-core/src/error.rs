//! Error types for core validation and decoding.

use thiserror::Error;

/// Errors raised while validating queries or decoding payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A query or record argument is outside its allowed range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
