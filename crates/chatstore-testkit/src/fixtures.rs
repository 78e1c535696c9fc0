//! Test fixtures and helpers.
//!
//! Common setup code for unit and integration tests.

use std::path::PathBuf;
use std::sync::{Arc, Once};

use bytes::Bytes;
use chatstore::{Database, DatabaseConfig, ReplayPhase};
use chatstore_binlog::KdfParams;
use chatstore_core::{
    encode_dated_payload, DialogId, DownloadRecord, MessageId, MessageRecord, PrefixedDateDecoder, StoryFullId,
    StoryId, StoryRecord,
};
use chatstore_store::{
    DialogDb, DialogSchema, DownloadsDb, DownloadsSchema, MessageDb, MessageSchema, MessageThreadDb,
    MessageThreadSchema, SchemaManager, SqliteDb, StoreSchema, StoryDb, StorySchema, WorkerConnection,
};
use rand::RngCore;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Databases
// ─────────────────────────────────────────────────────────────────────────────

/// A database directory that disappears with the fixture.
pub struct TempDatabase {
    dir: TempDir,
    pub config: DatabaseConfig,
}

impl TempDatabase {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let config = DatabaseConfig::new(dir.path().join("db"));
        Self { dir, config }
    }

    /// Same, with binlog encryption under `password`.
    pub fn encrypted(password: &str) -> Self {
        let mut fixture = Self::new();
        fixture.config.encryption_key = Some(password.to_string());
        fixture.config.binlog_kdf = KdfParams::new(64, 1);
        fixture
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Open without replaying anything.
    pub fn open_phase(&self) -> ReplayPhase {
        Database::open(self.config.clone()).unwrap_or_else(|err| panic!("failed to open database: {err}"))
    }

    /// Open and start, for tests that leave no foreign events in the binlog.
    pub fn open(&self) -> Database {
        self.open_phase()
            .start()
            .unwrap_or_else(|err| panic!("failed to start database: {err}"))
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory connection with `S` created.
pub fn memory_db<S: StoreSchema>() -> SqliteDb {
    let db = SqliteDb::open_in_memory().unwrap_or_else(|err| panic!("in-memory open failed: {err}"));
    SchemaManager::migrate::<S>(&db, 0).unwrap_or_else(|err| panic!("creating {} failed: {err}", S::NAME));
    db
}

pub fn memory_message_db() -> MessageDb {
    MessageDb::new(
        WorkerConnection::detached(memory_db::<MessageSchema>()),
        Arc::new(PrefixedDateDecoder),
    )
}

pub fn memory_dialog_db() -> DialogDb {
    DialogDb::new(WorkerConnection::detached(memory_db::<DialogSchema>()))
}

pub fn memory_story_db() -> StoryDb {
    StoryDb::new(WorkerConnection::detached(memory_db::<StorySchema>()))
}

pub fn memory_message_thread_db() -> MessageThreadDb {
    MessageThreadDb::new(WorkerConnection::detached(memory_db::<MessageThreadSchema>()))
}

pub fn memory_downloads_db() -> DownloadsDb {
    DownloadsDb::new(WorkerConnection::detached(memory_db::<DownloadsSchema>()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A message whose payload starts with `date`, as [`PrefixedDateDecoder`] expects.
pub fn dated_message(dialog_id: DialogId, message_id: i64, date: i32) -> MessageRecord {
    MessageRecord::new(
        dialog_id,
        MessageId::new(message_id),
        encode_dated_payload(date, &message_id.to_le_bytes()),
    )
}

/// A dated message searchable by `text` under `search_id`.
pub fn searchable_message(dialog_id: DialogId, message_id: i64, search_id: i64, text: &str) -> MessageRecord {
    dated_message(dialog_id, message_id, 0).with_search_text(search_id, text)
}

pub fn story(dialog_id: DialogId, story_id: i32, expires_at: i32) -> StoryRecord {
    StoryRecord::new(
        StoryFullId::new(dialog_id, StoryId::new(story_id)),
        story_id.to_le_bytes().to_vec(),
    )
    .with_expires_at(expires_at)
}

pub fn download(unique_file_id: &str, search_text: &str) -> DownloadRecord {
    DownloadRecord {
        unique_file_id: Bytes::copy_from_slice(unique_file_id.as_bytes()),
        file_source: Bytes::from_static(b"file-source"),
        search_text: search_text.to_string(),
        date: 0,
        priority: 0,
    }
}

/// `len` random bytes.
pub fn random_payload(len: usize) -> Bytes {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    Bytes::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstore_core::{FolderId, MessageDateDecoder};

    #[test]
    fn test_memory_stores_are_usable() {
        let mut messages = memory_message_db();
        messages.add_message(&dated_message(DialogId::new(1), 7, 100)).unwrap();
        let message = messages.get_message(DialogId::new(1), MessageId::new(7)).unwrap();
        assert_eq!(PrefixedDateDecoder.message_date(message.message_id, &message.data).unwrap(), 100);

        let mut dialogs = memory_dialog_db();
        dialogs.add_dialog(DialogId::new(1), FolderId::MAIN, 1, b"d", &[]).unwrap();

        let mut stories = memory_story_db();
        stories.add_story(&story(DialogId::new(1), 3, 50)).unwrap();

        let mut downloads = memory_downloads_db();
        downloads.add_download(&download("f1", "report")).unwrap();

        memory_message_thread_db();
    }

    #[test]
    fn test_random_payload_length() {
        assert_eq!(random_payload(16).len(), 16);
        assert_ne!(random_payload(32), random_payload(32));
    }

    #[tokio::test]
    async fn test_temp_database_round_trip() {
        init_tracing();
        let fixture = TempDatabase::encrypted("pw");
        let database = fixture.open();
        database.binlog_pmc().set("auth", "ok").unwrap();
        database.close_all().await.unwrap();

        let database = fixture.open();
        assert_eq!(database.binlog_pmc().get_str("auth").as_deref(), Some("ok"));
        database.close_and_destroy_all().await.unwrap();
        assert!(!fixture.config.binlog_path().exists());
    }
}
