//! Message store.
//!
//! Messages are keyed by `(dialog_id, message_id)`. Category queries use one
//! partial index per [`MessageSearchFilter`] bucket over `index_mask`, and
//! searchable messages are mirrored into the external-content FTS5 table
//! `messages_fts` by triggers keyed on `search_id`.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chatstore_core::{
    CalendarQuery, CallsQuery, CallsResult, DialogId, DialogMessage, FullMessage, MessageCalendar,
    MessageDateDecoder, MessageFtsQuery, MessageFtsResult, MessageId, MessagePosition, MessagePositions,
    MessageRecord, MessageSearchFilter, MessagesQuery, NotificationId, ScheduledMessageKey,
    ScheduledMessageRecord, SparsePositionsQuery, MESSAGE_DB_INDEX_COUNT, MESSAGE_DB_INDEX_COUNT_OLD,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::fts;
use crate::pool::WorkerConnection;
use crate::schema::{MigrationStep, SchemaVersion, StoreSchema};
use crate::sqlite_db::SqliteDb;
use crate::worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};

/// Rows read per calendar query.
const CALENDAR_LIMIT: i32 = 1000;

/// Messages past the binary search candidate checked for a later date match.
const DATE_LOOKAHEAD: i32 = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Schema of the message store.
pub struct MessageSchema;

impl StoreSchema for MessageSchema {
    const NAME: &'static str = "message";
    const MAIN_TABLE: &'static str = "messages";
    const TABLES: &'static [&'static str] = &["messages", "messages_fts", "scheduled_messages"];

    fn create(db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS messages (dialog_id INT8, message_id INT8, unique_message_id INT4, \
             sender_user_id INT8, random_id INT8, data BLOB, ttl_expires_at INT4, index_mask INT4, search_id INT8, \
             text STRING, notification_id INT4, top_thread_message_id INT8, PRIMARY KEY (dialog_id, message_id))",
        )?;
        db.exec(
            "CREATE INDEX IF NOT EXISTS message_by_random_id ON messages (dialog_id, random_id) \
             WHERE random_id IS NOT NULL",
        )?;
        db.exec(
            "CREATE INDEX IF NOT EXISTS message_by_unique_message_id ON messages \
             (unique_message_id) WHERE unique_message_id IS NOT NULL",
        )?;
        db.exec(
            "CREATE INDEX IF NOT EXISTS message_by_ttl ON messages \
             (ttl_expires_at) WHERE ttl_expires_at IS NOT NULL",
        )?;
        add_media_indices(db, 0, MESSAGE_DB_INDEX_COUNT)?;
        add_fts(db)?;
        add_call_index(db)?;
        add_notification_id_index(db)?;
        add_scheduled_messages_table(db)
    }

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep {
                version: SchemaVersion::AddMessageDbMediaIndex,
                name: "add_media_index",
                apply: |db, _| {
                    db.exec("ALTER TABLE messages ADD COLUMN index_mask INT4")?;
                    add_media_indices(db, 0, MESSAGE_DB_INDEX_COUNT_OLD)
                },
            },
            MigrationStep {
                version: SchemaVersion::AddMessageDb30MediaIndex,
                name: "add_30_media_index",
                apply: |db, _| add_media_indices(db, MESSAGE_DB_INDEX_COUNT_OLD, MESSAGE_DB_INDEX_COUNT),
            },
            MigrationStep {
                version: SchemaVersion::AddMessageDbFts,
                name: "add_fts",
                apply: |db, _| {
                    db.exec("ALTER TABLE messages ADD COLUMN search_id INT8")?;
                    db.exec("ALTER TABLE messages ADD COLUMN text STRING")?;
                    add_fts(db)
                },
            },
            MigrationStep {
                version: SchemaVersion::AddMessagesCallIndex,
                name: "add_call_index",
                apply: |db, _| add_call_index(db),
            },
            MigrationStep {
                version: SchemaVersion::AddNotificationsSupport,
                name: "add_notification_id",
                apply: |db, _| {
                    db.exec("ALTER TABLE messages ADD COLUMN notification_id INT4")?;
                    add_notification_id_index(db)
                },
            },
            MigrationStep {
                version: SchemaVersion::AddScheduledMessages,
                name: "add_scheduled_messages",
                apply: |db, _| add_scheduled_messages_table(db),
            },
            MigrationStep {
                version: SchemaVersion::AddMessageThreadSupport,
                name: "add_top_thread_message_id",
                apply: |db, _| db.exec("ALTER TABLE messages ADD COLUMN top_thread_message_id INT8"),
            },
        ]
    }
}

fn add_media_indices(db: &SqliteDb, begin: usize, end: usize) -> Result<()> {
    for i in begin..end {
        db.exec(&format!(
            "CREATE INDEX IF NOT EXISTS message_index_{} ON messages (dialog_id, message_id) \
             WHERE (index_mask & {}) != 0",
            i,
            1 << i
        ))?;
    }
    Ok(())
}

fn add_fts(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE INDEX IF NOT EXISTS message_by_search_id ON messages \
         (search_id) WHERE search_id IS NOT NULL",
    )?;
    db.exec(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(text, content='messages', \
         content_rowid='search_id', tokenize = \"unicode61 remove_diacritics 0 tokenchars '\x07'\")",
    )?;
    db.exec(
        "CREATE TRIGGER IF NOT EXISTS trigger_fts_delete BEFORE DELETE ON messages WHEN OLD.search_id IS NOT NULL \
         BEGIN INSERT INTO messages_fts(messages_fts, rowid, text) VALUES('delete', OLD.search_id, OLD.text); END",
    )?;
    db.exec(
        "CREATE TRIGGER IF NOT EXISTS trigger_fts_insert AFTER INSERT ON messages WHEN NEW.search_id IS NOT NULL \
         BEGIN INSERT INTO messages_fts(rowid, text) VALUES(NEW.search_id, NEW.text); END",
    )
}

fn call_indices() -> [usize; 2] {
    [
        MessageSearchFilter::Call.index().unwrap_or_default(),
        MessageSearchFilter::MissedCall.index().unwrap_or_default(),
    ]
}

fn add_call_index(db: &SqliteDb) -> Result<()> {
    for i in call_indices() {
        db.exec(&format!(
            "CREATE INDEX IF NOT EXISTS full_message_index_{} ON messages (unique_message_id) \
             WHERE (index_mask & {}) != 0",
            i,
            1 << i
        ))?;
    }
    Ok(())
}

fn add_notification_id_index(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE INDEX IF NOT EXISTS message_by_notification_id ON messages (dialog_id, notification_id) \
         WHERE notification_id IS NOT NULL",
    )
}

fn add_scheduled_messages_table(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE TABLE IF NOT EXISTS scheduled_messages (dialog_id INT8, message_id INT8, \
         server_message_id INT4, data BLOB, PRIMARY KEY (dialog_id, message_id))",
    )?;
    db.exec(
        "CREATE INDEX IF NOT EXISTS message_by_server_message_id ON scheduled_messages \
         (dialog_id, server_message_id) WHERE server_message_id IS NOT NULL",
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

const ADD_MESSAGE: &str = "INSERT OR REPLACE INTO messages VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";
const DELETE_MESSAGE: &str = "DELETE FROM messages WHERE dialog_id = ?1 AND message_id = ?2";
const DELETE_ALL_DIALOG_MESSAGES: &str = "DELETE FROM messages WHERE dialog_id = ?1 AND message_id <= ?2";
const DELETE_DIALOG_MESSAGES_BY_SENDER: &str = "DELETE FROM messages WHERE dialog_id = ?1 AND sender_user_id = ?2";

const GET_MESSAGE: &str = "SELECT message_id, data FROM messages WHERE dialog_id = ?1 AND message_id = ?2";
const GET_MESSAGE_BY_RANDOM_ID: &str =
    "SELECT message_id, data FROM messages WHERE dialog_id = ?1 AND random_id = ?2";
const GET_MESSAGE_BY_UNIQUE_MESSAGE_ID: &str =
    "SELECT dialog_id, message_id, data FROM messages WHERE unique_message_id = ?1";
const GET_EXPIRING_MESSAGES: &str =
    "SELECT dialog_id, message_id, data FROM messages WHERE ttl_expires_at <= ?1 LIMIT ?2";
const GET_MESSAGES_FROM_NOTIFICATION_ID: &str = "SELECT data, message_id FROM messages WHERE dialog_id = ?1 AND \
     notification_id < ?2 ORDER BY notification_id DESC LIMIT ?3";
const GET_MESSAGES_FTS: &str = "SELECT dialog_id, message_id, data, search_id FROM messages WHERE search_id \
     IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?1 AND rowid < ?2 \
     ORDER BY rowid DESC LIMIT ?3) ORDER BY search_id DESC";

const ADD_SCHEDULED_MESSAGE: &str = "INSERT OR REPLACE INTO scheduled_messages VALUES(?1, ?2, ?3, ?4)";
const GET_SCHEDULED_MESSAGE: &str =
    "SELECT message_id, data FROM scheduled_messages WHERE dialog_id = ?1 AND message_id = ?2";
const GET_SCHEDULED_SERVER_MESSAGE: &str =
    "SELECT message_id, data FROM scheduled_messages WHERE dialog_id = ?1 AND server_message_id = ?2";
const DELETE_SCHEDULED_MESSAGE: &str = "DELETE FROM scheduled_messages WHERE dialog_id = ?1 AND message_id = ?2";
const DELETE_SCHEDULED_SERVER_MESSAGE: &str =
    "DELETE FROM scheduled_messages WHERE dialog_id = ?1 AND server_message_id = ?2";
const GET_SCHEDULED_MESSAGES: &str = "SELECT data, message_id FROM scheduled_messages WHERE dialog_id = ?1 AND \
     message_id < ?2 ORDER BY message_id DESC LIMIT ?3";

/// An ascending and a descending scan over the same rows.
#[derive(Clone, Copy)]
struct RangeSql<'a> {
    asc: &'a str,
    desc: &'a str,
}

const ALL_MESSAGES: RangeSql<'static> = RangeSql {
    asc: "SELECT data, message_id FROM messages WHERE dialog_id = ?1 AND message_id > \
          ?2 ORDER BY message_id ASC LIMIT ?3",
    desc: "SELECT data, message_id FROM messages WHERE dialog_id = ?1 AND message_id < \
           ?2 ORDER BY message_id DESC LIMIT ?3",
};

struct IndexSql {
    ids: String,
    asc: String,
    desc: String,
}

struct MessageSql {
    index: Vec<IndexSql>,
    calls: [String; 2],
}

impl MessageSql {
    fn get() -> &'static Self {
        static SQL: OnceLock<MessageSql> = OnceLock::new();
        SQL.get_or_init(|| {
            let index = (0..MESSAGE_DB_INDEX_COUNT)
                .map(|i| IndexSql {
                    ids: format!(
                        "SELECT message_id FROM messages WHERE dialog_id = ?1 AND message_id < ?2 AND (index_mask & \
                         {}) != 0 ORDER BY message_id DESC LIMIT 1000000",
                        1 << i
                    ),
                    asc: format!(
                        "SELECT data, message_id FROM messages WHERE dialog_id = ?1 AND message_id > ?2 AND (index_mask & \
                         {}) != 0 ORDER BY message_id ASC LIMIT ?3",
                        1 << i
                    ),
                    desc: format!(
                        "SELECT data, message_id FROM messages WHERE dialog_id = ?1 AND message_id < ?2 AND (index_mask & \
                         {}) != 0 ORDER BY message_id DESC LIMIT ?3",
                        1 << i
                    ),
                })
                .collect();
            let calls = call_indices().map(|i| {
                format!(
                    "SELECT dialog_id, message_id, data FROM messages WHERE unique_message_id < ?1 AND (index_mask & \
                     {}) != 0 ORDER BY unique_message_id DESC LIMIT ?2",
                    1 << i
                )
            });
            MessageSql { index, calls }
        })
    }

    fn range(&self, index: usize) -> RangeSql<'_> {
        let sql = &self.index[index];
        RangeSql {
            asc: &sql.asc,
            desc: &sql.desc,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Row of `(data, message_id)`.
fn data_first(row: &Row<'_>) -> rusqlite::Result<DialogMessage> {
    Ok(DialogMessage {
        data: Bytes::from(row.get::<_, Vec<u8>>(0)?),
        message_id: MessageId::new(row.get(1)?),
    })
}

/// Row of `(message_id, data)`.
fn id_first(row: &Row<'_>) -> rusqlite::Result<DialogMessage> {
    Ok(DialogMessage {
        message_id: MessageId::new(row.get(0)?),
        data: Bytes::from(row.get::<_, Vec<u8>>(1)?),
    })
}

/// Row of `(dialog_id, message_id, data)`.
fn full_message(row: &Row<'_>) -> rusqlite::Result<FullMessage> {
    Ok(FullMessage {
        dialog_id: DialogId::new(row.get(0)?),
        message_id: MessageId::new(row.get(1)?),
        data: Bytes::from(row.get::<_, Vec<u8>>(2)?),
    })
}

fn query_range(db: &SqliteDb, sql: &str, dialog_id: DialogId, from: i64, limit: i32) -> Result<Vec<DialogMessage>> {
    let mut stmt = db.prepare_cached(sql)?;
    let rows = stmt.query_map(params![dialog_id.get(), from, limit], data_first)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn find_message(db: &SqliteDb, dialog_id: DialogId, message_id: MessageId) -> Result<DialogMessage> {
    db.prepare_cached(GET_MESSAGE)?
        .query_row(params![dialog_id.get(), message_id.get()], id_first)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("message {} in {}", message_id, dialog_id)))
}

/// Left window descending before `from`, right window ascending from `from`.
fn windowed(
    db: &SqliteDb,
    sql: RangeSql<'_>,
    dialog_id: DialogId,
    from_message_id: MessageId,
    offset: i32,
    limit: i32,
) -> Result<Vec<DialogMessage>> {
    let from = from_message_id.get();
    let left_count = limit + offset;
    let right_count = -offset;

    let left = if left_count != 0 {
        query_range(db, sql.desc, dialog_id, from, left_count)?
    } else {
        Vec::new()
    };
    let mut page = if right_count != 0 {
        query_range(db, sql.asc, dialog_id, from - 1, right_count)?
    } else {
        Vec::new()
    };
    page.reverse();
    page.extend(left);
    Ok(page)
}

fn check_ids(dialog_id: DialogId, message_id: MessageId) -> Result<()> {
    if !dialog_id.is_valid() {
        return Err(StoreError::InvalidArgument(format!("invalid dialog id {}", dialog_id)));
    }
    if !message_id.is_valid() {
        return Err(StoreError::InvalidArgument(format!("invalid message id {}", message_id)));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageDb
// ─────────────────────────────────────────────────────────────────────────────

/// Synchronous message store over one worker connection.
pub struct MessageDb {
    conn: WorkerConnection,
    decoder: Arc<dyn MessageDateDecoder>,
}

impl MessageDb {
    pub fn new(conn: WorkerConnection, decoder: Arc<dyn MessageDateDecoder>) -> Self {
        Self { conn, decoder }
    }

    fn db(&mut self) -> Result<&SqliteDb> {
        self.conn.get().map(|db| &*db)
    }

    fn parts(&mut self) -> Result<(&SqliteDb, &dyn MessageDateDecoder)> {
        let db: &SqliteDb = self.conn.get()?;
        Ok((db, self.decoder.as_ref()))
    }

    // ── writes ──────────────────────────────────────────────────────────────

    /// Insert or replace a message.
    pub fn add_message(&mut self, record: &MessageRecord) -> Result<()> {
        check_ids(record.dialog_id, record.message_id)?;
        tracing::debug!(dialog_id = %record.dialog_id, message_id = %record.message_id, "add message");

        let (search_id, text) = match record.search_id {
            Some(search_id) if search_id != 0 => (
                Some(search_id),
                Some(fts::indexed_text(&record.text, record.dialog_id, record.index_mask)),
            ),
            _ => (None, None),
        };

        self.db()?.prepare_cached(ADD_MESSAGE)?.execute(params![
            record.dialog_id.get(),
            record.message_id.get(),
            record.unique_message_id,
            record.sender_dialog_id.map(|id| id.get()),
            record.random_id,
            record.data.as_ref(),
            record.ttl_expires_at,
            (record.index_mask != 0).then_some(record.index_mask),
            search_id,
            text,
            record.notification_id.map(|id| id.get()),
            record.top_thread_message_id.map(|id| id.get()),
        ])?;
        Ok(())
    }

    pub fn add_scheduled_message(&mut self, record: &ScheduledMessageRecord) -> Result<()> {
        check_ids(record.dialog_id, record.message_id)?;
        tracing::debug!(dialog_id = %record.dialog_id, message_id = %record.message_id, "add scheduled message");
        self.db()?.prepare_cached(ADD_SCHEDULED_MESSAGE)?.execute(params![
            record.dialog_id.get(),
            record.message_id.get(),
            record.server_message_id,
            record.data.as_ref(),
        ])?;
        Ok(())
    }

    pub fn delete_message(&mut self, dialog_id: DialogId, message_id: MessageId) -> Result<()> {
        check_ids(dialog_id, message_id)?;
        tracing::debug!(%dialog_id, %message_id, "delete message");
        self.db()?
            .prepare_cached(DELETE_MESSAGE)?
            .execute(params![dialog_id.get(), message_id.get()])?;
        Ok(())
    }

    pub fn delete_scheduled_message(&mut self, dialog_id: DialogId, key: ScheduledMessageKey) -> Result<()> {
        let db = self.db()?;
        match key {
            ScheduledMessageKey::Local(message_id) => db
                .prepare_cached(DELETE_SCHEDULED_MESSAGE)?
                .execute(params![dialog_id.get(), message_id.get()])?,
            ScheduledMessageKey::Server(server_message_id) => db
                .prepare_cached(DELETE_SCHEDULED_SERVER_MESSAGE)?
                .execute(params![dialog_id.get(), server_message_id])?,
        };
        Ok(())
    }

    /// Delete every message of a dialog with an id up to and including `up_to`.
    pub fn delete_all_dialog_messages(&mut self, dialog_id: DialogId, up_to: MessageId) -> Result<()> {
        check_ids(dialog_id, up_to)?;
        tracing::info!(%dialog_id, %up_to, "delete all dialog messages");
        self.db()?
            .prepare_cached(DELETE_ALL_DIALOG_MESSAGES)?
            .execute(params![dialog_id.get(), up_to.get()])?;
        Ok(())
    }

    pub fn delete_dialog_messages_by_sender(&mut self, dialog_id: DialogId, sender_dialog_id: DialogId) -> Result<()> {
        if !dialog_id.is_valid() || !sender_dialog_id.is_valid() {
            return Err(StoreError::InvalidArgument(format!(
                "invalid dialog {} or sender {}",
                dialog_id, sender_dialog_id
            )));
        }
        tracing::info!(%dialog_id, sender = %sender_dialog_id, "delete dialog messages by sender");
        self.db()?
            .prepare_cached(DELETE_DIALOG_MESSAGES_BY_SENDER)?
            .execute(params![dialog_id.get(), sender_dialog_id.get()])?;
        Ok(())
    }

    // ── lookups ─────────────────────────────────────────────────────────────

    pub fn get_message(&mut self, dialog_id: DialogId, message_id: MessageId) -> Result<DialogMessage> {
        check_ids(dialog_id, message_id)?;
        find_message(self.db()?, dialog_id, message_id)
    }

    pub fn get_scheduled_message(&mut self, dialog_id: DialogId, key: ScheduledMessageKey) -> Result<DialogMessage> {
        let db = self.db()?;
        let found = match key {
            ScheduledMessageKey::Local(message_id) => db
                .prepare_cached(GET_SCHEDULED_MESSAGE)?
                .query_row(params![dialog_id.get(), message_id.get()], id_first)
                .optional()?,
            ScheduledMessageKey::Server(server_message_id) => db
                .prepare_cached(GET_SCHEDULED_SERVER_MESSAGE)?
                .query_row(params![dialog_id.get(), server_message_id], id_first)
                .optional()?,
        };
        found.ok_or_else(|| StoreError::NotFound(format!("scheduled message {:?} in {}", key, dialog_id)))
    }

    pub fn get_message_by_unique_message_id(&mut self, unique_message_id: i32) -> Result<FullMessage> {
        if unique_message_id <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "invalid unique message id {}",
                unique_message_id
            )));
        }
        self.db()?
            .prepare_cached(GET_MESSAGE_BY_UNIQUE_MESSAGE_ID)?
            .query_row([unique_message_id], full_message)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("unique message {}", unique_message_id)))
    }

    pub fn get_message_by_random_id(&mut self, dialog_id: DialogId, random_id: i64) -> Result<DialogMessage> {
        self.db()?
            .prepare_cached(GET_MESSAGE_BY_RANDOM_ID)?
            .query_row(params![dialog_id.get(), random_id], id_first)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("random id {} in {}", random_id, dialog_id)))
    }

    /// The message with the greatest id in `first..=last` whose date is at
    /// most `date`.
    ///
    /// Dates are only roughly ordered by id. A binary search over the id space
    /// finds a candidate in a logarithmic number of decodes, then the next
    /// [`DATE_LOOKAHEAD`] messages after it are checked for a later match. The
    /// answer is exact when dates are out of order by less than that window.
    pub fn get_dialog_message_by_date(
        &mut self,
        dialog_id: DialogId,
        first_message_id: MessageId,
        last_message_id: MessageId,
        date: i32,
    ) -> Result<DialogMessage> {
        check_ids(dialog_id, first_message_id)?;
        if first_message_id > last_message_id {
            return Err(StoreError::InvalidArgument(format!(
                "first message {} is after last message {}",
                first_message_id, last_message_id
            )));
        }

        let (db, decoder) = self.parts()?;
        let date_of = |message: &DialogMessage| decoder.message_date(message.message_id, &message.data);
        let last = last_message_id.get();
        let fits = |message: &DialogMessage| -> Result<bool> {
            Ok(message.message_id.get() <= last && date_of(message)? <= date)
        };

        let mut candidate = None;
        let first_rows = query_range(db, ALL_MESSAGES.asc, dialog_id, first_message_id.get() - 1, 1)?;
        if let Some(first) = first_rows.first() {
            if fits(first)? {
                let mut left = first.message_id.get();
                let mut right = last;
                let mut prev_pivot = None;
                while left <= right {
                    let middle = left + ((right - left) >> 1);
                    let pivot = query_range(db, ALL_MESSAGES.asc, dialog_id, middle, 1)?;
                    let pivot_id = pivot.first().map(|message| message.message_id.get());
                    match pivot.first() {
                        Some(message) if fits(message)? => left = message.message_id.get(),
                        _ => right = middle - 1,
                    }

                    if pivot_id == prev_pivot {
                        // Same pivot twice: only the message right after `left` can still qualify.
                        let near = query_range(db, ALL_MESSAGES.asc, dialog_id, left - 1, 2)?;
                        match near.get(1) {
                            Some(next) if fits(next)? => left = next.message_id.get(),
                            _ => break,
                        }
                    }
                    prev_pivot = pivot_id;
                }
                candidate = Some(left);
            }
        }

        let from = candidate.unwrap_or(first_message_id.get() - 1);
        let mut found = None;
        for message in query_range(db, ALL_MESSAGES.asc, dialog_id, from, DATE_LOOKAHEAD)? {
            if message.message_id.get() > last {
                break;
            }
            if date_of(&message)? <= date {
                found = Some(message);
            }
        }
        if let Some(message) = found {
            return Ok(message);
        }

        match candidate {
            Some(id) => find_message(db, dialog_id, MessageId::new(id)),
            None => Err(StoreError::NotFound(format!("message before date {} in {}", date, dialog_id))),
        }
    }

    /// Messages whose TTL ends at or before `expires_till`.
    pub fn get_expiring_messages(&mut self, expires_till: i32, limit: i32) -> Result<Vec<FullMessage>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_EXPIRING_MESSAGES)?;
        let rows = stmt.query_map(params![expires_till, limit], full_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── ranges and search ───────────────────────────────────────────────────

    /// Newest message of each day and the day's message count.
    pub fn get_dialog_message_calendar(&mut self, query: &CalendarQuery) -> Result<MessageCalendar> {
        query.validate()?;
        let Some(index) = query.filter.index() else {
            return Err(StoreError::InvalidArgument("calendar requires a filter".into()));
        };
        let (db, decoder) = self.parts()?;
        let rows = query_range(
            db,
            MessageSql::get().range(index).desc,
            query.dialog_id,
            query.from_message_id.get(),
            CALENDAR_LIMIT,
        )?;

        let mut calendar = MessageCalendar::default();
        let mut current_day = i64::MAX;
        for message in rows {
            let date = decoder.message_date(message.message_id, &message.data)?;
            let day = (i64::from(query.tz_offset) + i64::from(date)).div_euclid(86_400);
            match calendar.total_counts.last_mut() {
                Some(count) if day >= current_day => *count += 1,
                _ => {
                    current_day = day;
                    calendar.messages.push(message);
                    calendar.total_counts.push(1);
                }
            }
        }
        Ok(calendar)
    }

    /// `limit` evenly spaced messages of a filter with their dates.
    pub fn get_dialog_sparse_message_positions(&mut self, query: &SparsePositionsQuery) -> Result<MessagePositions> {
        query.validate()?;
        let Some(index) = query.filter.index() else {
            return Err(StoreError::InvalidArgument("sparse positions require a filter".into()));
        };
        let (db, decoder) = self.parts()?;
        let ids = {
            let mut stmt = db.prepare_cached(&MessageSql::get().index[index].ids)?;
            let rows = stmt.query_map(params![query.dialog_id.get(), query.from_message_id.get()], |row| {
                row.get::<_, i64>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let total = ids.len();
        let count = (query.limit as usize).min(total);
        let mut positions = MessagePositions::default();
        if count == 0 {
            return Ok(positions);
        }
        positions.total_count = total as i32;
        positions.positions.reserve(count);
        let delta = total as f64 / count as f64;
        for i in 0..count {
            let position = (((i as f64 + 0.5) * delta) as usize).min(total - 1);
            let message_id = MessageId::new(ids[position]);
            let message = find_message(db, query.dialog_id, message_id)?;
            let date = decoder.message_date(message_id, &message.data)?;
            positions.positions.push(MessagePosition {
                position: position as i32,
                date,
                message_id,
            });
        }
        Ok(positions)
    }

    /// A page of history around `query.from_message_id`, newest first.
    pub fn get_messages(&mut self, query: &MessagesQuery) -> Result<Vec<DialogMessage>> {
        query.validate()?;
        tracing::trace!(
            dialog_id = %query.dialog_id,
            from = %query.from_message_id,
            offset = query.offset,
            limit = query.limit,
            "load messages"
        );
        let db = self.db()?;
        let sql = match query.filter.index() {
            Some(index) => MessageSql::get().range(index),
            None => ALL_MESSAGES,
        };
        windowed(db, sql, query.dialog_id, query.from_message_id, query.offset, query.limit)
    }

    pub fn get_scheduled_messages(&mut self, dialog_id: DialogId, limit: i32) -> Result<Vec<DialogMessage>> {
        query_range(self.db()?, GET_SCHEDULED_MESSAGES, dialog_id, i64::MAX, limit)
    }

    pub fn get_messages_from_notification_id(
        &mut self,
        dialog_id: DialogId,
        from_notification_id: NotificationId,
        limit: i32,
    ) -> Result<Vec<DialogMessage>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_MESSAGES_FROM_NOTIFICATION_ID)?;
        let rows = stmt.query_map(params![dialog_id.get(), from_notification_id.get(), limit], data_first)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Call history across all dialogs, by descending unique message id.
    pub fn get_calls(&mut self, query: &CallsQuery) -> Result<CallsResult> {
        query.validate()?;
        let sql = match query.filter {
            MessageSearchFilter::Call => &MessageSql::get().calls[0],
            _ => &MessageSql::get().calls[1],
        };
        let db = self.db()?;
        let mut stmt = db.prepare_cached(sql)?;
        let rows = stmt.query_map(params![query.from_unique_message_id, query.limit], full_message)?;
        Ok(CallsResult {
            messages: rows.collect::<rusqlite::Result<Vec<_>>>()?,
        })
    }

    /// Full-text search, newest `search_id` first.
    pub fn get_messages_fts(&mut self, query: &MessageFtsQuery) -> Result<MessageFtsResult> {
        query.validate()?;
        let mut words = fts::prepare_query(&query.query);
        if words.is_empty() {
            return Ok(MessageFtsResult::default());
        }
        if query.dialog_id.is_valid() {
            words.push(' ');
            words.push_str(&fts::dialog_term(query.dialog_id));
        }
        if let Some(index) = query.filter.index() {
            words.push(' ');
            words.push_str(&fts::filter_term(index));
        }
        let from_search_id = match query.from_search_id {
            0 => i64::MAX,
            id => id,
        };
        tracing::debug!(query = %query.query, match_expr = %words, from_search_id, "search messages");

        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_MESSAGES_FTS)?;
        let mut rows = stmt.query(params![words, from_search_id, query.limit])?;
        let mut result = MessageFtsResult::default();
        while let Some(row) = rows.next()? {
            result.messages.push(full_message(row)?);
            result.next_search_id = row.get(3)?;
        }
        Ok(result)
    }
}

impl SyncStore for MessageDb {
    const NAME: &'static str = "message";

    fn connection(&mut self) -> Result<&mut SqliteDb> {
        self.conn.get()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageDbAsync
// ─────────────────────────────────────────────────────────────────────────────

/// Asynchronous handle to a [`MessageDb`] running on its own worker.
#[derive(Clone)]
pub struct MessageDbAsync {
    inner: AsyncStore<MessageDb>,
}

impl MessageDbAsync {
    pub fn spawn(db: MessageDb, config: BatchConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncStore::spawn(db, config)?,
        })
    }

    pub fn add_message(&self, record: MessageRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_message(&record))
    }

    pub fn add_scheduled_message(&self, record: ScheduledMessageRecord) -> Completion<()> {
        self.inner.write(move |db| db.add_scheduled_message(&record))
    }

    pub fn delete_message(&self, dialog_id: DialogId, message_id: MessageId) -> Completion<()> {
        self.inner.write(move |db| db.delete_message(dialog_id, message_id))
    }

    pub fn delete_scheduled_message(&self, dialog_id: DialogId, key: ScheduledMessageKey) -> Completion<()> {
        self.inner.write(move |db| db.delete_scheduled_message(dialog_id, key))
    }

    pub fn delete_all_dialog_messages(&self, dialog_id: DialogId, up_to: MessageId) -> Completion<()> {
        self.inner.read(move |db| db.delete_all_dialog_messages(dialog_id, up_to))
    }

    pub fn delete_dialog_messages_by_sender(&self, dialog_id: DialogId, sender_dialog_id: DialogId) -> Completion<()> {
        self.inner
            .read(move |db| db.delete_dialog_messages_by_sender(dialog_id, sender_dialog_id))
    }

    pub fn get_message(&self, dialog_id: DialogId, message_id: MessageId) -> Completion<DialogMessage> {
        self.inner.read(move |db| db.get_message(dialog_id, message_id))
    }

    pub fn get_scheduled_message(&self, dialog_id: DialogId, key: ScheduledMessageKey) -> Completion<DialogMessage> {
        self.inner.read(move |db| db.get_scheduled_message(dialog_id, key))
    }

    pub fn get_message_by_unique_message_id(&self, unique_message_id: i32) -> Completion<FullMessage> {
        self.inner
            .read(move |db| db.get_message_by_unique_message_id(unique_message_id))
    }

    pub fn get_message_by_random_id(&self, dialog_id: DialogId, random_id: i64) -> Completion<DialogMessage> {
        self.inner.read(move |db| db.get_message_by_random_id(dialog_id, random_id))
    }

    pub fn get_dialog_message_by_date(
        &self,
        dialog_id: DialogId,
        first_message_id: MessageId,
        last_message_id: MessageId,
        date: i32,
    ) -> Completion<DialogMessage> {
        self.inner.read(move |db| {
            db.get_dialog_message_by_date(dialog_id, first_message_id, last_message_id, date)
        })
    }

    pub fn get_expiring_messages(&self, expires_till: i32, limit: i32) -> Completion<Vec<FullMessage>> {
        self.inner.read(move |db| db.get_expiring_messages(expires_till, limit))
    }

    pub fn get_dialog_message_calendar(&self, query: CalendarQuery) -> Completion<MessageCalendar> {
        self.inner.read(move |db| db.get_dialog_message_calendar(&query))
    }

    pub fn get_dialog_sparse_message_positions(&self, query: SparsePositionsQuery) -> Completion<MessagePositions> {
        self.inner
            .read(move |db| db.get_dialog_sparse_message_positions(&query))
    }

    pub fn get_messages(&self, query: MessagesQuery) -> Completion<Vec<DialogMessage>> {
        self.inner.read(move |db| db.get_messages(&query))
    }

    pub fn get_scheduled_messages(&self, dialog_id: DialogId, limit: i32) -> Completion<Vec<DialogMessage>> {
        self.inner.read(move |db| db.get_scheduled_messages(dialog_id, limit))
    }

    pub fn get_messages_from_notification_id(
        &self,
        dialog_id: DialogId,
        from_notification_id: NotificationId,
        limit: i32,
    ) -> Completion<Vec<DialogMessage>> {
        self.inner.read(move |db| {
            db.get_messages_from_notification_id(dialog_id, from_notification_id, limit)
        })
    }

    pub fn get_calls(&self, query: CallsQuery) -> Completion<CallsResult> {
        self.inner.read(move |db| db.get_calls(&query))
    }

    pub fn get_messages_fts(&self, query: MessageFtsQuery) -> Completion<MessageFtsResult> {
        self.inner.read(move |db| db.get_messages_fts(&query))
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

    /// Handle used for uniform flush and shutdown.
    pub fn lifecycle(&self) -> Arc<dyn Lifecycle> {
        Arc::new(self.inner.clone())
    }
}
