//! Database configuration.

use std::path::{Path, PathBuf};

use chatstore_binlog::KdfParams;
use chatstore_core::DbKey;
use chatstore_store::BatchConfig;
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, Result};

/// Where the database lives and which stores it keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the binlog and the SQL file.
    pub database_directory: PathBuf,
    pub binlog_file_name: String,
    pub sqlite_file_name: String,
    /// Enables encryption of the binlog and, through it, of the SQL file.
    pub encryption_key: Option<String>,
    /// Argon2id cost for new password-encrypted binlog headers.
    pub binlog_kdf: KdfParams,
    /// Messages, dialogs and stories.
    pub use_message_database: bool,
    /// Message threads. Requires the message database.
    pub use_message_thread_database: bool,
    pub use_downloads_database: bool,
    /// Delete the SQL file on open while the session is not authorized.
    pub drop_unauthorized_cache: bool,
    pub batch: BatchConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_directory: PathBuf::new(),
            binlog_file_name: "td.binlog".to_string(),
            sqlite_file_name: "db.sqlite".to_string(),
            encryption_key: None,
            binlog_kdf: KdfParams::PASSWORD,
            use_message_database: true,
            use_message_thread_database: true,
            use_downloads_database: true,
            drop_unauthorized_cache: false,
            batch: BatchConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Default configuration rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            database_directory: directory.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DatabaseError::InvalidConfig(e.to_string()))
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_directory.as_os_str().is_empty() {
            return Err(DatabaseError::InvalidConfig("database_directory is empty".into()));
        }
        if self.binlog_file_name.is_empty() || self.sqlite_file_name.is_empty() {
            return Err(DatabaseError::InvalidConfig("file names must not be empty".into()));
        }
        if self.binlog_file_name == self.sqlite_file_name {
            return Err(DatabaseError::InvalidConfig(format!(
                "binlog and database share the file name {}",
                self.binlog_file_name
            )));
        }
        if self.binlog_kdf.memory_kib < 8
            || self.binlog_kdf.memory_kib > KdfParams::MAX_MEMORY_KIB
            || self.binlog_kdf.iterations == 0
        {
            return Err(DatabaseError::InvalidConfig(format!(
                "binlog_kdf of {} KiB and {} iterations is out of range",
                self.binlog_kdf.memory_kib, self.binlog_kdf.iterations
            )));
        }
        if self.batch.max_pending_writes == 0 {
            return Err(DatabaseError::InvalidConfig("batch.max_pending_writes must be positive".into()));
        }
        if self.use_message_thread_database && !self.use_message_database {
            return Err(DatabaseError::InvalidConfig(
                "the message thread database requires the message database".into(),
            ));
        }
        Ok(())
    }

    pub fn binlog_path(&self) -> PathBuf {
        self.database_directory.join(&self.binlog_file_name)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.database_directory.join(&self.sqlite_file_name)
    }

    pub fn directory(&self) -> &Path {
        &self.database_directory
    }

    /// Binlog key. A missing or empty key means no encryption.
    pub fn database_key(&self) -> DbKey {
        match &self.encryption_key {
            Some(key) if !key.is_empty() => DbKey::Password(key.clone()),
            _ => DbKey::Empty,
        }
    }
}
