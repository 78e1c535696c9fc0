//! Per-worker connection handout.
//!
//! A [`ConnectionPool`] is the only piece shared between workers. Each worker
//! asks it once for a [`WorkerConnection`] and owns that handle exclusively;
//! the underlying connection is opened on first use from the pool's
//! [`ConnectionFactory`]. The connection used for migrations can be handed
//! over with [`ConnectionPool::set`] and is claimed by the first worker that
//! needs one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chatstore_core::DbKey;

use crate::error::{Result, StoreError};
use crate::sqlite_db::SqliteDb;

/// Everything needed to open another connection to the same file.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    path: PathBuf,
    key: DbKey,
    cipher_version: Option<i32>,
}

impl ConnectionFactory {
    pub fn new(path: impl Into<PathBuf>, key: DbKey, cipher_version: Option<i32>) -> Self {
        Self {
            path: path.into(),
            key,
            cipher_version,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh session on the file. The file must already exist.
    pub fn open(&self) -> Result<SqliteDb> {
        let db = SqliteDb::open_with_key(&self.path, false, &self.key, self.cipher_version)?;
        db.apply_session_pragmas()?;
        tracing::debug!(path = %self.path.display(), "opened worker connection");
        Ok(db)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    closed: bool,
    seed: Option<SqliteDb>,
    opened: usize,
}

/// Shared connection source for all workers of one database file.
#[derive(Debug)]
pub struct ConnectionPool {
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(PoolState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand over an already open connection.
    pub fn set(&self, db: SqliteDb) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.seed = Some(db);
        Ok(())
    }

    /// A new exclusively owned handle for one worker.
    pub fn worker(self: &Arc<Self>) -> WorkerConnection {
        WorkerConnection {
            pool: Some(Arc::clone(self)),
            db: None,
        }
    }

    fn acquire(&self) -> Result<SqliteDb> {
        let seed = {
            let mut state = self.state();
            if state.closed {
                return Err(StoreError::Closed);
            }
            state.opened += 1;
            state.seed.take()
        };
        match seed {
            Some(db) => Ok(db),
            None => self.factory.open(),
        }
    }

    /// Invalidate every handle. The file is kept.
    ///
    /// Workers must have stopped using their handles before this is called.
    pub fn close(&self) {
        let seed = {
            let mut state = self.state();
            state.closed = true;
            state.seed.take()
        };
        if let Some(db) = seed {
            if let Err(err) = db.close() {
                tracing::warn!(error = %err, "closing pooled connection failed");
            }
        }
        tracing::info!(path = %self.factory.path().display(), "connection pool closed");
    }

    /// Invalidate every handle and delete the file.
    pub fn close_and_destroy(&self) -> Result<()> {
        self.close();
        SqliteDb::destroy(self.factory.path())?;
        tracing::info!(path = %self.factory.path().display(), "database destroyed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn path(&self) -> &Path {
        self.factory.path()
    }

    /// Number of worker connections handed out so far.
    pub fn connections_opened(&self) -> usize {
        self.state().opened
    }
}

/// One worker's private connection, opened lazily.
#[derive(Debug)]
pub struct WorkerConnection {
    pool: Option<Arc<ConnectionPool>>,
    db: Option<SqliteDb>,
}

impl WorkerConnection {
    /// A handle around a connection that belongs to no pool.
    pub fn detached(db: SqliteDb) -> Self {
        Self {
            pool: None,
            db: Some(db),
        }
    }

    /// The worker's connection, opening it on first use.
    pub fn get(&mut self) -> Result<&mut SqliteDb> {
        if let Some(pool) = &self.pool {
            if pool.is_closed() {
                self.db = None;
                return Err(StoreError::Closed);
            }
            if self.db.is_none() {
                self.db = Some(pool.acquire()?);
            }
        }
        self.db.as_mut().ok_or(StoreError::Closed)
    }

    /// Drop the connection. A pooled handle reopens on the next `get`.
    pub fn release(&mut self) {
        self.db = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_with_file() -> (TempDir, Arc<ConnectionPool>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let db = SqliteDb::open_with_key(&path, true, &DbKey::Empty, None).unwrap();
        db.exec("CREATE TABLE t (x INT)").unwrap();
        let pool = ConnectionPool::new(ConnectionFactory::new(path, DbKey::Empty, None));
        pool.set(db).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_first_worker_claims_seed() {
        let (_dir, pool) = pool_with_file();
        let mut first = pool.worker();
        let mut second = pool.worker();

        first.get().unwrap().execute("INSERT INTO t VALUES (1)", []).unwrap();
        let count: i64 = second
            .get()
            .unwrap()
            .query_row("SELECT count(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(pool.connections_opened(), 2);
    }

    #[test]
    fn test_close_invalidates_handles() {
        let (dir, pool) = pool_with_file();
        let mut worker = pool.worker();
        worker.get().unwrap();

        pool.close();
        assert!(matches!(worker.get(), Err(StoreError::Closed)));
        assert!(matches!(pool.set(SqliteDb::open_in_memory().unwrap()), Err(StoreError::Closed)));
        assert!(dir.path().join("db.sqlite").exists());
    }

    #[test]
    fn test_close_and_destroy_removes_file() {
        let (dir, pool) = pool_with_file();
        let mut worker = pool.worker();
        worker.get().unwrap();
        worker.release();

        pool.close_and_destroy().unwrap();
        assert!(!dir.path().join("db.sqlite").exists());
    }

    #[test]
    fn test_detached_handle() {
        let mut worker = WorkerConnection::detached(SqliteDb::open_in_memory().unwrap());
        worker.get().unwrap().exec("CREATE TABLE t (x INT)").unwrap();
        worker.release();
        assert!(matches!(worker.get(), Err(StoreError::Closed)));
    }
}
