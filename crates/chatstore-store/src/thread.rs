//! Message thread store, one row per thread keyed by its top message.

use std::sync::Arc;

use bytes::Bytes;
use chatstore_core::{DialogId, MessageId, MessageThreadRecord, MessageThreadsPage};
use rusqlite::{params, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::pool::WorkerConnection;
use crate::schema::StoreSchema;
use crate::sqlite_db::SqliteDb;
use crate::worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};

pub struct MessageThreadSchema;

impl StoreSchema for MessageThreadSchema {
    const NAME: &'static str = "message_thread";
    const MAIN_TABLE: &'static str = "threads";
    const TABLES: &'static [&'static str] = &["threads"];

    fn create(db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS threads (dialog_id INT8, thread_id INT8, thread_order INT8, data BLOB, \
             PRIMARY KEY (dialog_id, thread_id))",
        )?;
        db.exec("CREATE INDEX IF NOT EXISTS dialog_threads_by_thread_order ON threads (dialog_id, thread_order)")
    }
}

const ADD_THREAD: &str = "INSERT OR REPLACE INTO threads VALUES(?1, ?2, ?3, ?4)";
const DELETE_THREAD: &str = "DELETE FROM threads WHERE dialog_id = ?1 AND thread_id = ?2";
const DELETE_ALL_DIALOG_THREADS: &str = "DELETE FROM threads WHERE dialog_id = ?1";
const GET_THREAD: &str = "SELECT data FROM threads WHERE dialog_id = ?1 AND thread_id = ?2";
const GET_THREADS: &str = "SELECT data, dialog_id, thread_id, thread_order FROM threads WHERE dialog_id \
     = ?1 AND thread_order < ?2 ORDER BY thread_order DESC LIMIT ?3";

/// Synchronous message thread store over one worker connection.
pub struct MessageThreadDb {
    conn: WorkerConnection,
}

impl MessageThreadDb {
    pub fn new(conn: WorkerConnection) -> Self {
        Self { conn }
    }

    fn db(&mut self) -> Result<&SqliteDb> {
        self.conn.get().map(|db| &*db)
    }

    pub fn add_message_thread(&mut self, record: &MessageThreadRecord) -> Result<()> {
        if !record.dialog_id.is_valid() || !record.top_thread_message_id.is_valid() {
            return Err(StoreError::InvalidArgument(format!(
                "invalid thread {} in {}",
                record.top_thread_message_id, record.dialog_id
            )));
        }
        self.db()?.prepare_cached(ADD_THREAD)?.execute(params![
            record.dialog_id.get(),
            record.top_thread_message_id.get(),
            record.thread_order,
            &record.data[..],
        ])?;
        Ok(())
    }

    pub fn delete_message_thread(&mut self, dialog_id: DialogId, top_thread_message_id: MessageId) -> Result<()> {
        self.db()?
            .prepare_cached(DELETE_THREAD)?
            .execute(params![dialog_id.get(), top_thread_message_id.get()])?;
        Ok(())
    }

    pub fn delete_all_dialog_message_threads(&mut self, dialog_id: DialogId) -> Result<()> {
        let deleted = self
            .db()?
            .prepare_cached(DELETE_ALL_DIALOG_THREADS)?
            .execute([dialog_id.get()])?;
        tracing::debug!(%dialog_id, deleted, "delete all message threads");
        Ok(())
    }

    pub fn get_message_thread(&mut self, dialog_id: DialogId, top_thread_message_id: MessageId) -> Result<Bytes> {
        self.db()?
            .prepare_cached(GET_THREAD)?
            .query_row(params![dialog_id.get(), top_thread_message_id.get()], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
            .map(Bytes::from)
            .ok_or_else(|| StoreError::NotFound(format!("thread {} in {}", top_thread_message_id, dialog_id)))
    }

    /// Threads of a dialog with an order below `offset_order`, highest first.
    ///
    /// `next_order` is the order of the last returned thread, or
    /// `offset_order` when nothing was returned.
    pub fn get_message_threads(&mut self, dialog_id: DialogId, offset_order: i64, limit: i32) -> Result<MessageThreadsPage> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_THREADS)?;
        let mut rows = stmt.query(params![dialog_id.get(), offset_order, limit])?;

        let mut page = MessageThreadsPage {
            message_threads: Vec::new(),
            next_order: offset_order,
        };
        while let Some(row) = rows.next()? {
            page.message_threads.push(Bytes::from(row.get::<_, Vec<u8>>(0)?));
            page.next_order = row.get(3)?;
            tracing::trace!(%dialog_id, order = page.next_order, "load message thread");
        }
        Ok(page)
    }
}

impl SyncStore for MessageThreadDb {
    const NAME: &'static str = "message_thread";

    fn connection(&mut self) -> Result<&mut SqliteDb> {
        self.conn.get()
    }
}

/// Asynchronous handle to a [`MessageThreadDb`].
#[derive(Clone)]
pub struct MessageThreadDbAsync {
    inner: AsyncStore<MessageThreadDb>,
}

impl MessageThreadDbAsync {
    pub fn spawn(db: MessageThreadDb, config: BatchConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncStore::spawn(db, config)?,
        })
    }

    pub fn add_message_thread(&self, record: MessageThreadRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_message_thread(&record))
    }

    pub fn delete_message_thread(&self, dialog_id: DialogId, top_thread_message_id: MessageId) -> Completion<()> {
        self.inner
            .write(move |db| db.delete_message_thread(dialog_id, top_thread_message_id))
    }

    /// Runs after pending writes are flushed, outside of any batch.
    pub fn delete_all_dialog_message_threads(&self, dialog_id: DialogId) -> Completion<()> {
        self.inner
            .read(move |db| db.delete_all_dialog_message_threads(dialog_id))
    }

    pub fn get_message_thread(&self, dialog_id: DialogId, top_thread_message_id: MessageId) -> Completion<Bytes> {
        self.inner
            .read(move |db| db.get_message_thread(dialog_id, top_thread_message_id))
    }

    pub fn get_message_threads(&self, dialog_id: DialogId, offset_order: i64, limit: i32) -> Completion<MessageThreadsPage> {
        self.inner
            .read(move |db| db.get_message_threads(dialog_id, offset_order, limit))
    }

    pub fn force_flush(&self) -> Completion<()> {
        self.inner.force_flush()
    }

    pub fn close(&self) -> Completion<()> {
        self.inner.close()
    }

    pub fn stats(&self) -> &AsyncStoreStats {
        self.inner.stats()
    }

    pub fn lifecycle(&self) -> Arc<dyn Lifecycle> {
        Arc::new(self.inner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaManager;

    fn new_db() -> MessageThreadDb {
        let db = SqliteDb::open_in_memory().unwrap();
        SchemaManager::migrate::<MessageThreadSchema>(&db, 0).unwrap();
        MessageThreadDb::new(WorkerConnection::detached(db))
    }

    fn thread(dialog: i64, top: i64, order: i64) -> MessageThreadRecord {
        MessageThreadRecord {
            dialog_id: DialogId::new(dialog),
            top_thread_message_id: MessageId::new(top),
            thread_order: order,
            data: Bytes::from(format!("{}:{}", dialog, top)),
        }
    }

    #[test]
    fn test_threads_by_order() {
        let mut db = new_db();
        for (top, order) in [(1, 30), (2, 10), (3, 20)] {
            db.add_message_thread(&thread(1, top, order)).unwrap();
        }
        db.add_message_thread(&thread(2, 4, 50)).unwrap();

        let page = db.get_message_threads(DialogId::new(1), i64::MAX, 2).unwrap();
        assert_eq!(page.message_threads, vec![Bytes::from("1:1"), Bytes::from("1:3")]);
        assert_eq!(page.next_order, 20);

        let rest = db.get_message_threads(DialogId::new(1), page.next_order, 10).unwrap();
        assert_eq!(rest.message_threads, vec![Bytes::from("1:2")]);

        let empty = db.get_message_threads(DialogId::new(1), 10, 10).unwrap();
        assert!(empty.message_threads.is_empty());
        assert_eq!(empty.next_order, 10);
    }

    #[test]
    fn test_thread_deletes() {
        let mut db = new_db();
        db.add_message_thread(&thread(1, 1, 1)).unwrap();
        db.add_message_thread(&thread(1, 2, 2)).unwrap();
        db.add_message_thread(&thread(2, 1, 1)).unwrap();

        db.delete_message_thread(DialogId::new(1), MessageId::new(1)).unwrap();
        assert!(db
            .get_message_thread(DialogId::new(1), MessageId::new(1))
            .unwrap_err()
            .is_not_found());

        db.delete_all_dialog_message_threads(DialogId::new(1)).unwrap();
        assert!(db.get_message_threads(DialogId::new(1), i64::MAX, 10).unwrap().message_threads.is_empty());
        assert_eq!(
            db.get_message_thread(DialogId::new(2), MessageId::new(1)).unwrap(),
            Bytes::from("2:1")
        );
    }

    #[test]
    fn test_rejects_invalid_thread() {
        let mut db = new_db();
        assert!(matches!(
            db.add_message_thread(&thread(1, 0, 1)),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_async_range_delete_sees_pending_writes() {
        let store = MessageThreadDbAsync::spawn(new_db(), BatchConfig::default()).unwrap();
        let write = store.add_message_thread(thread(3, 1, 1));
        store.delete_all_dialog_message_threads(DialogId::new(3)).await.unwrap();
        write.await.unwrap();
        assert!(store
            .get_message_thread(DialogId::new(3), MessageId::new(1))
            .await
            .unwrap_err()
            .is_not_found());
        store.close().await.unwrap();
    }
}
