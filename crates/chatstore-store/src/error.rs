//! Error types for the store module.

use chatstore_core::CoreError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The requested row does not exist. An expected outcome of lookups.
    #[error("not found: {0}")]
    NotFound(String),

    /// An argument was rejected before reaching the database.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Schema creation or upgrade failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// The store or its connection pool has been closed.
    #[error("store is closed")]
    Closed,

    /// The write batch this operation belonged to was rolled back.
    #[error("write batch aborted: {0}")]
    BatchAborted(String),

    /// Opening or re-keying an encrypted database failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Query validation or payload decoding failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    /// Whether this is the ordinary "row absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
