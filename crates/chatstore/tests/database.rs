//! End-to-end lifecycle of the database: open, replay, serve, close.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use bytes::Bytes;
use chatstore::binlog::{BinlogEvent, HandlerType};
use chatstore::core::{DialogId, DownloadRecord, DownloadsFtsQuery, FolderId};
use chatstore::store::{SqliteDb, StoreError};
use chatstore::{
    Database, DatabaseConfig, DatabaseError, ReplayContext, ReplayHandler, AUTH_KEY, SQLITE_KEY,
};
use tempfile::TempDir;

const FIRST: HandlerType = HandlerType::new(0x100);
const SECOND: HandlerType = HandlerType::new(0x200);

fn config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig::new(dir.path().join("db"))
}

fn download(name: &str) -> DownloadRecord {
    DownloadRecord {
        unique_file_id: Bytes::copy_from_slice(name.as_bytes()),
        file_source: Bytes::from_static(b"source"),
        search_text: name.to_string(),
        date: 1,
        priority: 0,
    }
}

/// Records the payloads it sees into a log shared between handlers.
struct Recorder {
    handler_type: HandlerType,
    log: Rc<RefCell<Vec<Bytes>>>,
}

impl ReplayHandler for Recorder {
    fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    fn replay(&mut self, _ctx: &mut ReplayContext<'_>, event: &BinlogEvent) -> chatstore::Result<()> {
        self.log.borrow_mut().push(event.data.clone());
        Ok(())
    }
}

/// Restores a dialog from its event, then drops the event.
struct DialogRestorer;

impl ReplayHandler for DialogRestorer {
    fn handler_type(&self) -> HandlerType {
        FIRST
    }

    fn replay(&mut self, ctx: &mut ReplayContext<'_>, event: &BinlogEvent) -> chatstore::Result<()> {
        ctx.stores
            .dialog()?
            .add_dialog(DialogId::new(event.id as i64), FolderId::MAIN, 1, &event.data, &[])?;
        ctx.binlog.erase_event(event.id)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_fresh_open_creates_every_store() -> Result<()> {
    let dir = TempDir::new()?;
    let phase = Database::open(config(&dir))?;
    assert!(phase.was_dialog_db_created());
    assert!(phase.pending_handler_types().is_empty());

    let database = phase.run(&mut [])?;
    database.message_db()?;
    database.dialog_db()?;
    database.story_db()?;
    database.message_thread_db()?;
    database.downloads_db()?;
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() -> Result<()> {
    let mut config = DatabaseConfig::new("");
    assert!(matches!(Database::open(config.clone()), Err(DatabaseError::InvalidConfig(_))));
    config.database_directory = "/tmp".into();
    config.batch.max_pending_writes = 0;
    assert!(matches!(Database::open(config), Err(DatabaseError::InvalidConfig(_))));
    Ok(())
}

#[tokio::test]
async fn test_data_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;

    let database = Database::open(config(&dir))?.start()?;
    database
        .dialog_db()?
        .add_dialog(DialogId::new(5), FolderId::MAIN, 100, Bytes::from_static(b"d5"), Vec::new())
        .await?;
    database.downloads_db()?.add_download(download("holiday photos")).await?;
    database.config_pmc().set("option", "on")?;
    database.close_all().await?;

    let phase = Database::open(config(&dir))?;
    assert!(!phase.was_dialog_db_created());
    assert_eq!(phase.config_pmc().get_str("option").as_deref(), Some("on"));
    let database = phase.start()?;

    let dialog = database.dialog_db()?.get_dialog(DialogId::new(5)).await?;
    assert_eq!(dialog, Bytes::from_static(b"d5"));
    let found = database
        .downloads_db()?
        .get_downloads_fts(DownloadsFtsQuery {
            query: "holi".into(),
            offset: 0,
            limit: 10,
        })
        .await?;
    assert_eq!(found.downloads.len(), 1);
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_replay_follows_handler_order() -> Result<()> {
    let dir = TempDir::new()?;

    let database = Database::open(config(&dir))?.start()?;
    database.binlog().add_event(SECOND, &b"s1"[..])?;
    database.binlog().add_event(FIRST, &b"f1"[..])?;
    database.binlog().add_event(SECOND, &b"s2"[..])?;
    database.close_all().await?;

    let phase = Database::open(config(&dir))?;
    assert_eq!(phase.pending_handler_types(), vec![FIRST, SECOND]);
    assert_eq!(phase.events(SECOND).len(), 2);

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut second = Recorder {
        handler_type: SECOND,
        log: Rc::clone(&log),
    };
    let mut first = Recorder {
        handler_type: FIRST,
        log: Rc::clone(&log),
    };
    let database = phase.run(&mut [&mut second, &mut first])?;
    assert_eq!(
        *log.borrow(),
        vec![Bytes::from_static(b"s1"), Bytes::from_static(b"s2"), Bytes::from_static(b"f1")]
    );
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_unclaimed_events_fail_replay() -> Result<()> {
    let dir = TempDir::new()?;

    let database = Database::open(config(&dir))?.start()?;
    database.binlog().add_event(FIRST, &b"f"[..])?;
    database.binlog().add_event(SECOND, &b"s"[..])?;
    database.close_all().await?;

    let log = Rc::new(RefCell::new(Vec::new()));
    let mut first = Recorder {
        handler_type: FIRST,
        log: Rc::clone(&log),
    };
    let result = Database::open(config(&dir))?.run(&mut [&mut first]);
    assert!(matches!(
        result,
        Err(DatabaseError::UnhandledEvent { handler_type, count: 1 }) if handler_type == SECOND
    ));
    Ok(())
}

#[tokio::test]
async fn test_replay_writes_are_visible_after_start() -> Result<()> {
    let dir = TempDir::new()?;

    let database = Database::open(config(&dir))?.start()?;
    let id = database.binlog().add_event(FIRST, &b"restored"[..])?;
    database.close_all().await?;

    let database = Database::open(config(&dir))?.run(&mut [&mut DialogRestorer])?;
    let dialog = database.dialog_db()?.get_dialog(DialogId::new(id as i64)).await?;
    assert_eq!(dialog, Bytes::from_static(b"restored"));
    database.close_all().await?;

    let phase = Database::open(config(&dir))?;
    assert!(phase.events(FIRST).is_empty());
    phase.start()?.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_wrong_key() -> Result<()> {
    let dir = TempDir::new()?;

    let database = Database::open(config(&dir).with_encryption_key("right"))?.start()?;
    database.close_all().await?;

    assert!(matches!(
        Database::open(config(&dir).with_encryption_key("wrong")),
        Err(DatabaseError::WrongKey)
    ));
    assert!(matches!(Database::open(config(&dir)), Err(DatabaseError::WrongKey)));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_key_lifecycle() -> Result<()> {
    let dir = TempDir::new()?;
    let encrypted = config(&dir).with_encryption_key("secret");

    let database = Database::open(encrypted.clone())?.start()?;
    let sqlite_key = database.binlog_pmc().get(SQLITE_KEY);
    assert_eq!(sqlite_key.as_ref().map(Bytes::len), Some(32));
    database
        .dialog_db()?
        .add_dialog(DialogId::new(1), FolderId::MAIN, 1, Bytes::from_static(b"kept"), Vec::new())
        .await?;
    database.close_all().await?;

    let mut database = Database::open(encrypted)?.start()?;
    assert_eq!(database.binlog_pmc().get(SQLITE_KEY), sqlite_key);
    database.change_database_encryption_key(None)?;
    database.close_all().await?;

    let database = Database::open(config(&dir))?.start()?;
    assert!(database.binlog_pmc().get(SQLITE_KEY).is_none());
    let dialog = database.dialog_db()?.get_dialog(DialogId::new(1)).await?;
    assert_eq!(dialog, Bytes::from_static(b"kept"));
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_recreated_dialog_store_clears_dependent_keys() -> Result<()> {
    let dir = TempDir::new()?;
    let mut without_messages = config(&dir);
    without_messages.use_message_database = false;
    without_messages.use_message_thread_database = false;

    let database = Database::open(without_messages)?.start()?;
    assert!(matches!(database.dialog_db(), Err(DatabaseError::StoreDisabled(_))));
    let pmc = database.binlog_pmc();
    pmc.set("pinned_dialog_ids0", "1,2")?;
    pmc.set("dlds_counter", "3")?;
    pmc.set("next_contacts_sync_date", "99")?;
    pmc.set("unrelated", "x")?;
    database.close_all().await?;

    let phase = Database::open(config(&dir))?;
    assert!(phase.was_dialog_db_created());
    let pmc = phase.binlog_pmc();
    assert!(!pmc.contains("pinned_dialog_ids0"));
    assert!(!pmc.contains("dlds_counter"));
    assert!(pmc.contains("next_contacts_sync_date"));
    assert!(pmc.contains("unrelated"));
    phase.start()?.close_all().await?;

    SqliteDb::destroy(&config(&dir).sqlite_path())?;
    let phase = Database::open(config(&dir))?;
    assert!(!phase.binlog_pmc().contains("next_contacts_sync_date"));
    phase.start()?.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_cache_is_dropped() -> Result<()> {
    let dir = TempDir::new()?;
    let mut dropping = config(&dir);
    dropping.drop_unauthorized_cache = true;

    let database = Database::open(config(&dir))?.start()?;
    database
        .dialog_db()?
        .add_dialog(DialogId::new(3), FolderId::MAIN, 1, Bytes::from_static(b"cached"), Vec::new())
        .await?;
    database.close_all().await?;

    let database = Database::open(dropping.clone())?.start()?;
    let missing = database.dialog_db()?.get_dialog(DialogId::new(3)).await;
    assert!(matches!(missing, Err(ref err) if err.is_not_found()));
    database
        .dialog_db()?
        .add_dialog(DialogId::new(3), FolderId::MAIN, 1, Bytes::from_static(b"cached"), Vec::new())
        .await?;
    database.binlog_pmc().set(AUTH_KEY, "ok")?;
    database.close_all().await?;

    let database = Database::open(dropping)?.start()?;
    assert!(database.dialog_db()?.get_dialog(DialogId::new(3)).await.is_ok());
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_flush_all_commits_pending_writes() -> Result<()> {
    let dir = TempDir::new()?;
    let database = Database::open(config(&dir))?.start()?;
    let dialogs = database.dialog_db()?;

    let pending: Vec<_> = (1..=60)
        .map(|id| dialogs.add_dialog(DialogId::new(id), FolderId::MAIN, id, Bytes::from_static(b"d"), Vec::new()))
        .collect();
    database.flush_all().await?;
    assert_eq!(dialogs.stats().writes_committed(), 60);
    for write in pending {
        write.await?;
    }
    database.close_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_handles_are_closed_after_close_all() -> Result<()> {
    let dir = TempDir::new()?;
    let database = Database::open(config(&dir))?.start()?;
    let dialogs = database.dialog_db()?.clone();
    let binlog = database.binlog().clone();

    database.close_all().await?;
    assert!(matches!(
        dialogs.get_dialog(DialogId::new(1)).await,
        Err(StoreError::Closed)
    ));
    assert!(binlog.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_close_and_destroy_removes_files() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(&dir);

    let database = Database::open(config.clone())?.start()?;
    database.binlog_pmc().set("k", "v")?;
    database.close_and_destroy_all().await?;

    assert!(!config.binlog_path().exists());
    assert!(!config.sqlite_path().exists());
    assert!(!config.database_directory.exists());
    Ok(())
}

#[tokio::test]
async fn test_destroy_without_opening() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(&dir);

    Database::open(config.clone())?.start()?.close_all().await?;
    assert!(config.binlog_path().exists());

    Database::destroy(&config)?;
    assert!(!config.binlog_path().exists());
    assert!(!config.sqlite_path().exists());

    let phase = Database::open(config)?;
    assert!(phase.was_dialog_db_created());
    phase.start()?.close_all().await?;
    Ok(())
}
