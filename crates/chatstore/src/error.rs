//! Error types for the database aggregator.

use chatstore_binlog::{BinlogError, HandlerType};
use chatstore_core::CoreError;
use chatstore_store::StoreError;
use thiserror::Error;

/// Errors that can occur while opening, replaying or closing the database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQL store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Binlog error.
    #[error("binlog error: {0}")]
    Binlog(#[from] BinlogError),

    /// Record or query validation error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// I/O error outside the binlog and the SQL engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The encryption key does not open the binlog.
    #[error("wrong database encryption key")]
    WrongKey,

    /// The configuration was rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Replayed events that no handler claimed.
    #[error("{count} binlog events of type {handler_type} have no handler")]
    UnhandledEvent { handler_type: HandlerType, count: usize },

    /// The store was disabled in the configuration.
    #[error("{0} database is disabled")]
    StoreDisabled(&'static str),

    /// A replay handler failed.
    #[error("replay failed: {0}")]
    Replay(String),

    /// A background close or flush task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
