//! SQLite connection wrapper.
//!
//! [`SqliteDb`] owns one [`rusqlite::Connection`] and adds what every store
//! needs on top of it: keyed open with SQLCipher, re-keying of an existing
//! file, the session pragmas, nested transaction bookkeeping and removal of
//! a database together with its side files.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chatstore_core::DbKey;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::error::{Result, StoreError};

/// How long a statement waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Prepared statements kept per connection.
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// Compatibility mode tried when an encrypted file does not open with defaults.
const LEGACY_CIPHER_COMPATIBILITY: i32 = 3;

/// Side files SQLite may leave next to a database.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// A single database connection plus transaction state.
pub struct SqliteDb {
    conn: Connection,
    path: Option<PathBuf>,
    transaction_depth: u32,
    cipher_version: Option<i32>,
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("path", &self.path)
            .field("transaction_depth", &self.transaction_depth)
            .field("cipher_version", &self.cipher_version)
            .finish()
    }
}

impl Deref for SqliteDb {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl SqliteDb {
    // ─────────────────────────────────────────────────────────────────────────
    // Opening
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn,
            path,
            transaction_depth: 0,
            cipher_version: None,
        }
    }

    /// SQLCipher version linked into this build, `None` for plain SQLite.
    pub fn cipher_support() -> Option<&'static str> {
        static SUPPORT: OnceLock<Option<String>> = OnceLock::new();
        SUPPORT
            .get_or_init(|| {
                let conn = Connection::open_in_memory().ok()?;
                conn.query_row("PRAGMA cipher_version", [], |row| row.get::<_, String>(0))
                    .optional()
                    .ok()
                    .flatten()
            })
            .as_deref()
    }

    /// Open `path` with `key`.
    ///
    /// When the first attempt fails for a keyed database and no compatibility
    /// mode was requested, the open is retried in legacy compatibility mode.
    pub fn open_with_key(
        path: &Path,
        allow_creation: bool,
        key: &DbKey,
        cipher_version: Option<i32>,
    ) -> Result<Self> {
        let result = Self::do_open_with_key(path, allow_creation, key, cipher_version.unwrap_or(0));
        match result {
            Err(err) if cipher_version.is_none() && !key.is_empty() && Self::cipher_support().is_some() => {
                tracing::debug!(
                    path = %path.display(),
                    error = %err,
                    "retrying open in legacy cipher compatibility mode"
                );
                Self::do_open_with_key(path, false, key, LEGACY_CIPHER_COMPATIBILITY)
            }
            other => other,
        }
    }

    fn do_open_with_key(path: &Path, allow_creation: bool, key: &DbKey, cipher_version: i32) -> Result<Self> {
        let conn = Self::open_connection(path, allow_creation)?;
        let mut db = Self::from_connection(conn, Some(path.to_path_buf()));

        if !key.is_empty() {
            if Self::cipher_support().is_none() {
                tracing::warn!(
                    path = %path.display(),
                    "database key ignored: SQLite was built without SQLCipher"
                );
            } else {
                if db.check_encryption().is_ok() {
                    return Err(StoreError::Encryption(format!(
                        "no key is needed for database {}",
                        path.display()
                    )));
                }
                db.conn
                    .execute_batch(&format!("PRAGMA key = {}", key.to_sqlcipher_literal()))?;
                if cipher_version != 0 {
                    tracing::info!(cipher_version, "using SQLCipher compatibility mode");
                    db.conn
                        .execute_batch(&format!("PRAGMA cipher_compatibility = {}", cipher_version))?;
                }
                db.cipher_version = Some(cipher_version);
            }
        }

        db.check_encryption().map_err(|err| {
            StoreError::Encryption(format!("can't check database {}: {}", path.display(), err))
        })?;
        Ok(db)
    }

    fn open_connection(path: &Path, allow_creation: bool) -> Result<Connection> {
        if !path.exists() {
            if !allow_creation {
                return Err(StoreError::NotFound(format!(
                    "database {} disappeared and can't be recreated",
                    path.display()
                )));
            }
            Self::destroy(path)?;
        }

        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if allow_creation {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(conn)
    }

    fn check_encryption(&self) -> Result<()> {
        self.conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Open `path` so that it ends up encrypted with `new_key`.
    ///
    /// Tries `new_key` first. Otherwise the file is opened with `old_key` and
    /// exported into an encrypted copy, exported into a plaintext copy, or
    /// re-keyed in place, depending on which of the keys are empty.
    pub fn change_key(path: &Path, allow_creation: bool, new_key: &DbKey, old_key: &DbKey) -> Result<Self> {
        if Self::cipher_support().is_none() {
            if !new_key.is_empty() || !old_key.is_empty() {
                tracing::warn!(
                    path = %path.display(),
                    "opening database without encryption: SQLCipher is unavailable"
                );
            }
            return Self::open_with_key(path, allow_creation, &DbKey::Empty, None);
        }

        match Self::open_with_key(path, allow_creation, new_key, None) {
            Ok(db) => return Ok(db),
            Err(err) => tracing::debug!(error = %err, "database does not open with the new key"),
        }

        let db = Self::open_with_key(path, false, old_key, None)?;
        let user_version = db.user_version()?;
        let new_literal = new_key.to_sqlcipher_literal();

        if old_key.is_empty() && !new_key.is_empty() {
            tracing::info!(path = %path.display(), "encrypting database");
            let tmp_path = export_path(path);
            create_empty_database(&tmp_path)?;
            db.execute_batch("CREATE TABLE IF NOT EXISTS encryption_dummy_table(id INT PRIMARY KEY)")?;
            db.execute_batch(&format!(
                "ATTACH DATABASE '{}' AS encrypted KEY {}",
                quote_path(&tmp_path),
                new_literal
            ))?;
            db.query_row("SELECT sqlcipher_export('encrypted')", [], |_| Ok(()))?;
            db.execute_batch(&format!("PRAGMA encrypted.user_version = {}", user_version))?;
            db.execute_batch("DETACH DATABASE encrypted")?;
            db.close()?;
            std::fs::rename(&tmp_path, path)?;
        } else if !old_key.is_empty() && new_key.is_empty() {
            tracing::info!(path = %path.display(), "decrypting database");
            let tmp_path = export_path(path);
            create_empty_database(&tmp_path)?;
            db.execute_batch(&format!(
                "ATTACH DATABASE '{}' AS decrypted KEY ''",
                quote_path(&tmp_path)
            ))?;
            db.query_row("SELECT sqlcipher_export('decrypted')", [], |_| Ok(()))?;
            db.execute_batch(&format!("PRAGMA decrypted.user_version = {}", user_version))?;
            db.execute_batch("DETACH DATABASE decrypted")?;
            db.close()?;
            std::fs::rename(&tmp_path, path)?;
        } else {
            tracing::info!(path = %path.display(), "re-keying database");
            db.execute_batch(&format!("PRAGMA rekey = {}", new_literal))?;
            db.close()?;
        }

        let new_db = Self::open_with_key(path, false, new_key, None)?;
        let new_version = new_db.user_version()?;
        if new_version != user_version {
            return Err(StoreError::Encryption(format!(
                "user_version changed from {} to {} while changing key",
                user_version, new_version
            )));
        }
        Ok(new_db)
    }

    /// Close the connection, reporting errors the drop would swallow.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| StoreError::Database(err))
    }

    /// Remove a database file and its side files. Missing files are fine.
    pub fn destroy(path: &Path) -> Result<()> {
        remove_if_exists(path)?;
        for suffix in SIDE_FILE_SUFFIXES {
            remove_if_exists(&with_suffix(path, suffix))?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply the pragmas every connection runs with.
    pub fn apply_session_pragmas(&self) -> Result<()> {
        self.conn.pragma_update(None, "encoding", "UTF-8")?;
        let journal_mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "temp_store", "MEMORY")?;
        self.conn.pragma_update(None, "secure_delete", 1)?;
        // REPLACE must fire the full-text delete triggers.
        self.conn.pragma_update(None, "recursive_triggers", 1)?;
        tracing::debug!(%journal_mode, path = ?self.path, "session pragmas applied");
        Ok(())
    }

    /// Run one or more statements.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(|err| {
            tracing::debug!(sql, error = %err, "statement failed");
            StoreError::Database(err)
        })
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count == 1)
    }

    pub fn user_version(&self) -> Result<i32> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn set_user_version(&self, version: i32) -> Result<()> {
        self.conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Compatibility mode the key was applied with, `None` when unkeyed.
    pub fn cipher_version(&self) -> Option<i32> {
        self.cipher_version
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn begin_read_transaction(&mut self) -> Result<()> {
        self.begin("BEGIN")
    }

    pub fn begin_write_transaction(&mut self) -> Result<()> {
        self.begin("BEGIN IMMEDIATE")
    }

    fn begin(&mut self, sql: &str) -> Result<()> {
        self.transaction_depth += 1;
        if self.transaction_depth == 1 {
            if let Err(err) = self.conn.execute_batch(sql) {
                self.transaction_depth = 0;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Commit. Only the outermost commit reaches the database.
    pub fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction_depth {
            0 => Err(StoreError::InvalidArgument(
                "commit without an open transaction".into(),
            )),
            1 => {
                self.transaction_depth = 0;
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            _ => {
                self.transaction_depth -= 1;
                Ok(())
            }
        }
    }

    /// Abandon the whole transaction, however deeply nested.
    pub fn rollback_transaction(&mut self) -> Result<()> {
        self.transaction_depth = 0;
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth > 0
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn export_path(path: &Path) -> PathBuf {
    with_suffix(path, ".encrypted")
}

fn quote_path(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn create_empty_database(path: &Path) -> Result<()> {
    SqliteDb::destroy(path)?;
    let conn = Connection::open(path)?;
    conn.close().map_err(|(_, err)| StoreError::Database(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_nested_transactions_commit_once() {
        let mut db = SqliteDb::open_in_memory().unwrap();
        db.exec("CREATE TABLE t (x INT)").unwrap();

        db.begin_write_transaction().unwrap();
        db.begin_write_transaction().unwrap();
        db.execute("INSERT INTO t VALUES (1)", []).unwrap();
        db.commit_transaction().unwrap();
        assert!(!db.is_autocommit());
        db.commit_transaction().unwrap();
        assert!(db.is_autocommit());

        let count: i64 = db.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_rollback_discards_nested_work() {
        let mut db = SqliteDb::open_in_memory().unwrap();
        db.exec("CREATE TABLE t (x INT)").unwrap();

        db.begin_write_transaction().unwrap();
        db.begin_write_transaction().unwrap();
        db.execute("INSERT INTO t VALUES (1)", []).unwrap();
        db.rollback_transaction().unwrap();
        assert!(!db.in_transaction());

        let count: i64 = db.query_row("SELECT count(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let mut db = SqliteDb::open_in_memory().unwrap();
        assert!(matches!(
            db.commit_transaction(),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_user_version_and_has_table() {
        let db = SqliteDb::open_in_memory().unwrap();
        assert_eq!(db.user_version().unwrap(), 0);
        db.set_user_version(15).unwrap();
        assert_eq!(db.user_version().unwrap(), 15);

        assert!(!db.has_table("messages").unwrap());
        db.exec("CREATE TABLE messages (x INT)").unwrap();
        assert!(db.has_table("messages").unwrap());
    }

    #[test]
    fn test_open_missing_without_creation_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.sqlite");
        let err = SqliteDb::open_with_key(&path, false, &DbKey::Empty, None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_session_pragmas_on_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let db = SqliteDb::open_with_key(&path, true, &DbKey::Empty, None).unwrap();
        db.apply_session_pragmas().unwrap();

        let mode: String = db.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let recursive: i64 = db
            .query_row("PRAGMA recursive_triggers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(recursive, 1);
    }

    #[test]
    fn test_destroy_removes_side_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        {
            let db = SqliteDb::open_with_key(&path, true, &DbKey::Empty, None).unwrap();
            db.apply_session_pragmas().unwrap();
            db.exec("CREATE TABLE t (x INT); INSERT INTO t VALUES (1);").unwrap();
        }
        std::fs::write(with_suffix(&path, "-journal"), b"stale").unwrap();

        SqliteDb::destroy(&path).unwrap();
        assert!(!path.exists());
        for suffix in SIDE_FILE_SUFFIXES {
            assert!(!with_suffix(&path, suffix).exists());
        }
        // Destroying twice is not an error.
        SqliteDb::destroy(&path).unwrap();
    }

    #[test]
    fn test_change_key_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        {
            let db = SqliteDb::open_with_key(&path, true, &DbKey::Empty, None).unwrap();
            db.exec("CREATE TABLE t (x INT); INSERT INTO t VALUES (7);").unwrap();
            db.set_user_version(11).unwrap();
        }

        let key = DbKey::generate_raw();
        let db = SqliteDb::change_key(&path, false, &key, &DbKey::Empty).unwrap();
        assert_eq!(db.user_version().unwrap(), 11);
        let x: i64 = db.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
        drop(db);

        if SqliteDb::cipher_support().is_some() {
            assert!(SqliteDb::open_with_key(&path, false, &DbKey::Empty, None).is_err());
        }

        let db = SqliteDb::change_key(&path, false, &DbKey::Empty, &key).unwrap();
        let x: i64 = db.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
    }
}
