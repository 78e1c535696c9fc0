//! Story store: individual stories, the active stories of each dialog and
//! the saved state of each story list.

use std::sync::Arc;

use bytes::Bytes;
use chatstore_core::{
    ActiveStoriesRecord, ActiveStoryListPage, DialogId, DialogStory, FullStory, NotificationId, StoryFullId,
    StoryId, StoryListId, StoryRecord,
};
use rusqlite::{params, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::pool::WorkerConnection;
use crate::schema::StoreSchema;
use crate::sqlite_db::SqliteDb;
use crate::worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};

/// Schema of the story store. It has no upgrade ladder: a file missing any
/// of its tables gets the whole store recreated.
pub struct StorySchema;

impl StoreSchema for StorySchema {
    const NAME: &'static str = "story";
    const MAIN_TABLE: &'static str = "stories";
    const TABLES: &'static [&'static str] = &["stories", "active_stories", "active_story_lists"];

    fn is_present(db: &SqliteDb) -> Result<bool> {
        for table in Self::TABLES {
            if !db.has_table(table)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn create(db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS stories (dialog_id INT8, story_id INT4, expires_at INT4, notification_id \
             INT4, data BLOB, PRIMARY KEY (dialog_id, story_id))",
        )?;
        db.exec("CREATE INDEX IF NOT EXISTS story_by_ttl ON stories (expires_at) WHERE expires_at IS NOT NULL")?;
        db.exec(
            "CREATE INDEX IF NOT EXISTS story_by_notification_id ON stories (dialog_id, notification_id) WHERE \
             notification_id IS NOT NULL",
        )?;
        db.exec(
            "CREATE TABLE IF NOT EXISTS active_stories (dialog_id INT8 PRIMARY KEY, story_list_id INT4, \
             dialog_order INT8, data BLOB)",
        )?;
        db.exec(
            "CREATE INDEX IF NOT EXISTS active_stories_by_order ON active_stories (story_list_id, dialog_order, \
             dialog_id) WHERE story_list_id IS NOT NULL",
        )?;
        db.exec("CREATE TABLE IF NOT EXISTS active_story_lists (story_list_id INT4 PRIMARY KEY, data BLOB)")
    }
}

const ADD_STORY: &str = "INSERT OR REPLACE INTO stories VALUES(?1, ?2, ?3, ?4, ?5)";
const DELETE_STORY: &str = "DELETE FROM stories WHERE dialog_id = ?1 AND story_id = ?2";
const GET_STORY: &str = "SELECT data FROM stories WHERE dialog_id = ?1 AND story_id = ?2";
const GET_EXPIRING_STORIES: &str = "SELECT dialog_id, story_id, data FROM stories WHERE expires_at <= ?1 LIMIT ?2";
const GET_STORIES_FROM_NOTIFICATION_ID: &str = "SELECT story_id, data FROM stories WHERE dialog_id = ?1 AND \
     notification_id < ?2 ORDER BY notification_id DESC LIMIT ?3";
const ADD_ACTIVE_STORIES: &str = "INSERT OR REPLACE INTO active_stories VALUES(?1, ?2, ?3, ?4)";
const DELETE_ACTIVE_STORIES: &str = "DELETE FROM active_stories WHERE dialog_id = ?1";
const GET_ACTIVE_STORIES: &str = "SELECT data FROM active_stories WHERE dialog_id = ?1";
const GET_ACTIVE_STORY_LIST: &str = "SELECT data, dialog_id, dialog_order FROM active_stories WHERE \
     story_list_id = ?1 AND (dialog_order < ?2 OR (dialog_order = ?2 AND dialog_id < ?3)) ORDER \
     BY dialog_order DESC, dialog_id DESC LIMIT ?4";
const ADD_ACTIVE_STORY_LIST_STATE: &str = "INSERT OR REPLACE INTO active_story_lists VALUES(?1, ?2)";
const GET_ACTIVE_STORY_LIST_STATE: &str = "SELECT data FROM active_story_lists WHERE story_list_id = ?1";

fn check_story_id(story_full_id: StoryFullId) -> Result<()> {
    if !story_full_id.dialog_id.is_valid() || !story_full_id.story_id.is_valid() {
        return Err(StoreError::InvalidArgument(format!(
            "invalid story {}/{}",
            story_full_id.dialog_id, story_full_id.story_id
        )));
    }
    Ok(())
}

/// Synchronous story store over one worker connection.
pub struct StoryDb {
    conn: WorkerConnection,
}

impl StoryDb {
    pub fn new(conn: WorkerConnection) -> Self {
        Self { conn }
    }

    fn db(&mut self) -> Result<&SqliteDb> {
        self.conn.get().map(|db| &*db)
    }

    fn get_blob(&mut self, sql: &str, params: impl rusqlite::Params, what: impl FnOnce() -> String) -> Result<Bytes> {
        self.db()?
            .prepare_cached(sql)?
            .query_row(params, |row| row.get::<_, Vec<u8>>(0))
            .optional()?
            .map(Bytes::from)
            .ok_or_else(|| StoreError::NotFound(what()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Stories
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_story(&mut self, record: &StoryRecord) -> Result<()> {
        let id = record.story_full_id;
        check_story_id(id)?;
        tracing::debug!(dialog_id = %id.dialog_id, story_id = %id.story_id, "add story");

        let expires_at = record.expires_at.filter(|&date| date != 0);
        let notification_id = record
            .notification_id
            .filter(NotificationId::is_valid)
            .map(|id| id.get());
        self.db()?.prepare_cached(ADD_STORY)?.execute(params![
            id.dialog_id.get(),
            id.story_id.get(),
            expires_at,
            notification_id,
            &record.data[..],
        ])?;
        Ok(())
    }

    pub fn delete_story(&mut self, story_full_id: StoryFullId) -> Result<()> {
        check_story_id(story_full_id)?;
        tracing::debug!(dialog_id = %story_full_id.dialog_id, story_id = %story_full_id.story_id, "delete story");
        self.db()?
            .prepare_cached(DELETE_STORY)?
            .execute(params![story_full_id.dialog_id.get(), story_full_id.story_id.get()])?;
        Ok(())
    }

    pub fn get_story(&mut self, story_full_id: StoryFullId) -> Result<Bytes> {
        check_story_id(story_full_id)?;
        self.get_blob(
            GET_STORY,
            params![story_full_id.dialog_id.get(), story_full_id.story_id.get()],
            || format!("story {}/{}", story_full_id.dialog_id, story_full_id.story_id),
        )
    }

    /// Stories that expire at or before `expires_till`.
    pub fn get_expiring_stories(&mut self, expires_till: i32, limit: i32) -> Result<Vec<FullStory>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_EXPIRING_STORIES)?;
        let rows = stmt.query_map(params![expires_till, limit], |row| {
            Ok(FullStory {
                story_full_id: StoryFullId::new(DialogId::new(row.get(0)?), StoryId::new(row.get(1)?)),
                data: Bytes::from(row.get::<_, Vec<u8>>(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stories of a dialog with a notification id below `from_notification_id`,
    /// newest notification first.
    pub fn get_stories_from_notification_id(
        &mut self,
        dialog_id: DialogId,
        from_notification_id: NotificationId,
        limit: i32,
    ) -> Result<Vec<DialogStory>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_STORIES_FROM_NOTIFICATION_ID)?;
        let rows = stmt.query_map(params![dialog_id.get(), from_notification_id.get(), limit], |row| {
            Ok(DialogStory {
                story_id: StoryId::new(row.get(0)?),
                data: Bytes::from(row.get::<_, Vec<u8>>(1)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Active stories
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_active_stories(&mut self, record: &ActiveStoriesRecord) -> Result<()> {
        if !record.dialog_id.is_valid() {
            return Err(StoreError::InvalidArgument(format!("invalid dialog id {}", record.dialog_id)));
        }
        self.db()?.prepare_cached(ADD_ACTIVE_STORIES)?.execute(params![
            record.dialog_id.get(),
            record.story_list_id.map(|list| list.get()),
            record.dialog_order,
            &record.data[..],
        ])?;
        Ok(())
    }

    pub fn delete_active_stories(&mut self, dialog_id: DialogId) -> Result<()> {
        self.db()?
            .prepare_cached(DELETE_ACTIVE_STORIES)?
            .execute([dialog_id.get()])?;
        Ok(())
    }

    pub fn get_active_stories(&mut self, dialog_id: DialogId) -> Result<Bytes> {
        self.get_blob(GET_ACTIVE_STORIES, [dialog_id.get()], || {
            format!("active stories of {}", dialog_id)
        })
    }

    /// Active stories of a list strictly after the cursor `(order, dialog_id)`.
    pub fn get_active_story_list(
        &mut self,
        story_list_id: StoryListId,
        order: i64,
        dialog_id: DialogId,
        limit: i32,
    ) -> Result<ActiveStoryListPage> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_ACTIVE_STORY_LIST)?;
        let mut rows = stmt.query(params![story_list_id.get(), order, dialog_id.get(), limit])?;

        let mut page = ActiveStoryListPage {
            active_stories: Vec::new(),
            next_order: order,
            next_dialog_id: dialog_id,
        };
        while let Some(row) = rows.next()? {
            let data = Bytes::from(row.get::<_, Vec<u8>>(0)?);
            page.next_dialog_id = DialogId::new(row.get(1)?);
            page.next_order = row.get(2)?;
            tracing::trace!(dialog_id = %page.next_dialog_id, order = page.next_order, "load active stories");
            page.active_stories.push(ActiveStoriesRecord {
                dialog_id: page.next_dialog_id,
                story_list_id: Some(story_list_id),
                dialog_order: page.next_order,
                data,
            });
        }
        Ok(page)
    }

    pub fn add_active_story_list_state(&mut self, story_list_id: StoryListId, data: &[u8]) -> Result<()> {
        self.db()?
            .prepare_cached(ADD_ACTIVE_STORY_LIST_STATE)?
            .execute(params![story_list_id.get(), data])?;
        Ok(())
    }

    pub fn get_active_story_list_state(&mut self, story_list_id: StoryListId) -> Result<Bytes> {
        self.get_blob(GET_ACTIVE_STORY_LIST_STATE, [story_list_id.get()], || {
            format!("state of {} story list", story_list_id)
        })
    }
}

impl SyncStore for StoryDb {
    const NAME: &'static str = "story";

    fn connection(&mut self) -> Result<&mut SqliteDb> {
        self.conn.get()
    }
}

/// Asynchronous handle to a [`StoryDb`].
#[derive(Clone)]
pub struct StoryDbAsync {
    inner: AsyncStore<StoryDb>,
}

impl StoryDbAsync {
    pub fn spawn(db: StoryDb, config: BatchConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncStore::spawn(db, config)?,
        })
    }

    pub fn add_story(&self, record: StoryRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_story(&record))
    }

    pub fn delete_story(&self, story_full_id: StoryFullId) -> Completion<()> {
        self.inner.write(move |db| db.delete_story(story_full_id))
    }

    pub fn get_story(&self, story_full_id: StoryFullId) -> Completion<Bytes> {
        self.inner.read(move |db| db.get_story(story_full_id))
    }

    pub fn get_expiring_stories(&self, expires_till: i32, limit: i32) -> Completion<Vec<FullStory>> {
        self.inner
            .read(move |db| db.get_expiring_stories(expires_till, limit))
    }

    pub fn get_stories_from_notification_id(
        &self,
        dialog_id: DialogId,
        from_notification_id: NotificationId,
        limit: i32,
    ) -> Completion<Vec<DialogStory>> {
        self.inner
            .read(move |db| db.get_stories_from_notification_id(dialog_id, from_notification_id, limit))
    }

    pub fn add_active_stories(&self, record: ActiveStoriesRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_active_stories(&record))
    }

    pub fn delete_active_stories(&self, dialog_id: DialogId) -> Completion<()> {
        self.inner.write(move |db| db.delete_active_stories(dialog_id))
    }

    pub fn get_active_stories(&self, dialog_id: DialogId) -> Completion<Bytes> {
        self.inner.read(move |db| db.get_active_stories(dialog_id))
    }

    pub fn get_active_story_list(
        &self,
        story_list_id: StoryListId,
        order: i64,
        dialog_id: DialogId,
        limit: i32,
    ) -> Completion<ActiveStoryListPage> {
        self.inner
            .read(move |db| db.get_active_story_list(story_list_id, order, dialog_id, limit))
    }

    pub fn add_active_story_list_state(&self, story_list_id: StoryListId, data: Bytes) -> Completion<()> {
        self.inner
            .write(move |db| db.add_active_story_list_state(story_list_id, &data))
    }

    pub fn get_active_story_list_state(&self, story_list_id: StoryListId) -> Completion<Bytes> {
        self.inner
            .read(move |db| db.get_active_story_list_state(story_list_id))
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
