//! Downloads store with full-text search over each download's search text.

use std::sync::Arc;

use bytes::Bytes;
use chatstore_core::{DownloadRecord, DownloadShort, DownloadsFtsQuery, DownloadsFtsResult};
use rusqlite::{params, Row};

use crate::error::Result;
use crate::fts;
use crate::pool::WorkerConnection;
use crate::schema::StoreSchema;
use crate::sqlite_db::SqliteDb;
use crate::worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};

/// Download ids at or above this bound are never listed as active.
pub const ACTIVE_DOWNLOADS_OFFSET: i64 = 1 << 60;

/// Most downloads returned by [`DownloadsDb::get_active_downloads`].
pub const ACTIVE_DOWNLOADS_LIMIT: i32 = 2000;

pub struct DownloadsSchema;

impl StoreSchema for DownloadsSchema {
    const NAME: &'static str = "downloads";
    const MAIN_TABLE: &'static str = "downloads";
    const TABLES: &'static [&'static str] = &["downloads", "downloads_fts"];

    fn create(db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS downloads(download_id INTEGER PRIMARY KEY, unique_file_id \
             BLOB UNIQUE, file_source BLOB, search_text STRING, date INT4, priority INT4)",
        )?;
        db.exec(
            "CREATE VIRTUAL TABLE IF NOT EXISTS downloads_fts USING fts5(search_text, content='downloads', \
             content_rowid='download_id', tokenize = \"unicode61 remove_diacritics 0 tokenchars '\x07'\")",
        )?;
        db.exec(
            "CREATE TRIGGER IF NOT EXISTS trigger_downloads_fts_delete BEFORE DELETE ON downloads \
             BEGIN INSERT INTO downloads_fts(downloads_fts, rowid, search_text) VALUES('delete', \
             OLD.download_id, OLD.search_text); END",
        )?;
        db.exec(
            "CREATE TRIGGER IF NOT EXISTS trigger_downloads_fts_insert AFTER INSERT ON downloads \
             BEGIN INSERT INTO downloads_fts(rowid, search_text) VALUES(NEW.download_id, NEW.search_text); END",
        )
    }
}

const ADD_DOWNLOAD: &str = "INSERT OR REPLACE INTO downloads VALUES(NULL, ?1, ?2, ?3, ?4, ?5)";
const DELETE_DOWNLOAD: &str = "DELETE FROM downloads WHERE unique_file_id = ?1";
const GET_DOWNLOADS_FTS: &str = "SELECT download_id, unique_file_id, file_source, priority FROM downloads WHERE \
     download_id IN (SELECT rowid FROM downloads_fts WHERE downloads_fts MATCH ?1 AND rowid < ?2 \
     ORDER BY rowid DESC LIMIT ?3) ORDER BY download_id DESC";
const GET_ACTIVE_DOWNLOADS: &str = "SELECT download_id, unique_file_id, file_source, priority FROM downloads \
     WHERE download_id < ?1 ORDER BY download_id DESC LIMIT ?2";

fn download_short(row: &Row<'_>) -> rusqlite::Result<DownloadShort> {
    Ok(DownloadShort {
        download_id: row.get(0)?,
        unique_file_id: Bytes::from(row.get::<_, Vec<u8>>(1)?),
        file_source: Bytes::from(row.get::<_, Vec<u8>>(2)?),
        priority: row.get(3)?,
    })
}

/// Synchronous downloads store over one worker connection.
pub struct DownloadsDb {
    conn: WorkerConnection,
}

impl DownloadsDb {
    pub fn new(conn: WorkerConnection) -> Self {
        Self { conn }
    }

    fn db(&mut self) -> Result<&SqliteDb> {
        self.conn.get().map(|db| &*db)
    }

    /// Insert a download under a fresh id, replacing any entry for the same file.
    pub fn add_download(&mut self, record: &DownloadRecord) -> Result<()> {
        self.db()?.prepare_cached(ADD_DOWNLOAD)?.execute(params![
            &record.unique_file_id[..],
            &record.file_source[..],
            record.search_text,
            record.date,
            record.priority,
        ])?;
        Ok(())
    }

    pub fn delete_download(&mut self, unique_file_id: &[u8]) -> Result<()> {
        let deleted = self
            .db()?
            .prepare_cached(DELETE_DOWNLOAD)?
            .execute([unique_file_id])?;
        tracing::debug!(unique_file_id = %hex::encode(unique_file_id), deleted, "delete download");
        Ok(())
    }

    /// Downloads matching the query with an id below `offset`, newest first.
    pub fn get_downloads_fts(&mut self, query: &DownloadsFtsQuery) -> Result<DownloadsFtsResult> {
        query.validate()?;
        let words = fts::prepare_query(&query.query);
        if words.is_empty() {
            return Ok(DownloadsFtsResult::default());
        }
        let offset = match query.offset {
            0 => i64::MAX,
            offset => offset,
        };

        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_DOWNLOADS_FTS)?;
        let mut rows = stmt.query(params![words, offset, query.limit])?;
        let mut result = DownloadsFtsResult::default();
        while let Some(row) = rows.next()? {
            let download = download_short(row)?;
            result.next_download_id = download.download_id;
            result.downloads.push(download);
        }
        Ok(result)
    }

    /// The newest downloads, regardless of search text.
    pub fn get_active_downloads(&mut self) -> Result<Vec<DownloadShort>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_ACTIVE_DOWNLOADS)?;
        let rows = stmt.query_map(params![ACTIVE_DOWNLOADS_OFFSET, ACTIVE_DOWNLOADS_LIMIT], download_short)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl SyncStore for DownloadsDb {
    const NAME: &'static str = "downloads";

    fn connection(&mut self) -> Result<&mut SqliteDb> {
        self.conn.get()
    }
}

/// Asynchronous handle to a [`DownloadsDb`].
#[derive(Clone)]
pub struct DownloadsDbAsync {
    inner: AsyncStore<DownloadsDb>,
}

impl DownloadsDbAsync {
    pub fn spawn(db: DownloadsDb, config: BatchConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncStore::spawn(db, config)?,
        })
    }

    pub fn add_download(&self, record: DownloadRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_download(&record))
    }

    pub fn delete_download(&self, unique_file_id: Bytes) -> Completion<()> {
        self.inner.write(move |db| db.delete_download(&unique_file_id))
    }

    pub fn get_downloads_fts(&self, query: DownloadsFtsQuery) -> Completion<DownloadsFtsResult> {
        self.inner.read(move |db| db.get_downloads_fts(&query))
    }

    pub fn get_active_downloads(&self) -> Completion<Vec<DownloadShort>> {
        self.inner.read(|db| db.get_active_downloads())
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

    fn new_db() -> DownloadsDb {
        let db = SqliteDb::open_in_memory().unwrap();
        db.apply_session_pragmas().unwrap();
        SchemaManager::migrate::<DownloadsSchema>(&db, 0).unwrap();
        DownloadsDb::new(WorkerConnection::detached(db))
    }

    fn download(file: &str, text: &str) -> DownloadRecord {
        DownloadRecord {
            unique_file_id: Bytes::from(file.to_string()),
            file_source: Bytes::from(format!("src-{}", file)),
            search_text: text.to_string(),
            date: 1,
            priority: 1,
        }
    }

    fn search(db: &mut DownloadsDb, query: &str, offset: i64, limit: i32) -> DownloadsFtsResult {
        db.get_downloads_fts(&DownloadsFtsQuery {
            query: query.to_string(),
            offset,
            limit,
        })
        .unwrap()
    }

    fn files(downloads: &[DownloadShort]) -> Vec<Bytes> {
        downloads.iter().map(|d| d.unique_file_id.clone()).collect()
    }

    #[test]
    fn test_search_downloads() {
        let mut db = new_db();
        db.add_download(&download("a", "holiday photos")).unwrap();
        db.add_download(&download("b", "work report")).unwrap();
        db.add_download(&download("c", "holiday video")).unwrap();

        let result = search(&mut db, "holi", 0, 10);
        assert_eq!(files(&result.downloads), vec![Bytes::from("c"), Bytes::from("a")]);
        assert_eq!(result.next_download_id, result.downloads[1].download_id);

        let page = search(&mut db, "holiday", 0, 1);
        let next = search(&mut db, "holiday", page.next_download_id, 1);
        assert_eq!(files(&next.downloads), vec![Bytes::from("a")]);

        assert!(search(&mut db, "!!", 0, 10).downloads.is_empty());
    }

    #[test]
    fn test_replace_reindexes_download() {
        let mut db = new_db();
        db.add_download(&download("a", "first title")).unwrap();
        db.add_download(&download("a", "second title")).unwrap();

        assert!(search(&mut db, "first", 0, 10).downloads.is_empty());
        let found = search(&mut db, "second", 0, 10);
        assert_eq!(found.downloads.len(), 1);
        assert_eq!(db.get_active_downloads().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_download() {
        let mut db = new_db();
        db.add_download(&download("a", "song")).unwrap();
        db.add_download(&download("b", "song")).unwrap();
        db.delete_download(b"a").unwrap();

        assert_eq!(files(&search(&mut db, "song", 0, 10).downloads), vec![Bytes::from("b")]);
        assert_eq!(files(&db.get_active_downloads().unwrap()), vec![Bytes::from("b")]);
    }

    #[test]
    fn test_active_downloads_newest_first() {
        let mut db = new_db();
        for file in ["x", "y", "z"] {
            db.add_download(&download(file, "")).unwrap();
        }
        let active = db.get_active_downloads().unwrap();
        assert_eq!(files(&active), vec![Bytes::from("z"), Bytes::from("y"), Bytes::from("x")]);
        assert_eq!(active[0].file_source, Bytes::from("src-z"));
    }

    #[tokio::test]
    async fn test_async_downloads() {
        let store = DownloadsDbAsync::spawn(new_db(), BatchConfig::default()).unwrap();
        let write = store.add_download(download("f", "manual"));
        let active = store.get_active_downloads().await.unwrap();
        write.await.unwrap();
        assert_eq!(active.len(), 1);
        store.close().await.unwrap();
    }
}
