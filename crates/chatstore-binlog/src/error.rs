//! Error types for the binlog module.

use thiserror::Error;

/// Errors that can occur during binlog operations.
#[derive(Debug, Error)]
pub enum BinlogError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key does not match the one the file was written with.
    #[error("wrong binlog password")]
    WrongPassword,

    /// The file header or an event could not be parsed.
    #[error("corrupted binlog: {0}")]
    Corrupted(String),

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Key-value entry encoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A rewrite or erase named an event that is not live.
    #[error("unknown event {0}")]
    UnknownEvent(u64),

    /// The binlog has been closed.
    #[error("binlog is closed")]
    Closed,
}

/// Result type for binlog operations.
pub type Result<T> = std::result::Result<T, BinlogError>;
