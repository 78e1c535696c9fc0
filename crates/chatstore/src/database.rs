//! Opening, running and shutting down the whole database.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chatstore_binlog::{Binlog, BinlogError, BinlogEvent, BinlogKeyValue, HandlerType, KeyValueLoader, SharedBinlog};
use chatstore_core::{DbKey, MessageDateDecoder, PrefixedDateDecoder};
use chatstore_store::{
    ConnectionFactory, ConnectionPool, DialogDb, DialogDbAsync, DialogSchema, DownloadsDb, DownloadsDbAsync,
    DownloadsSchema, Lifecycle, MessageDb, MessageDbAsync, MessageSchema, MessageThreadDb, MessageThreadDbAsync,
    MessageThreadSchema, SchemaManager, SchemaVersion, SqliteDb, StoreSchema, StoryDb, StoryDbAsync, StorySchema,
};
use tokio::task::JoinSet;

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, Result};
use crate::replay::{ReplayPhase, SyncStores};

/// Binlog key holding the raw SQL encryption key.
pub const SQLITE_KEY: &str = "sqlite_key";

/// Binlog key set once the session is authorized.
pub const AUTH_KEY: &str = "auth";

/// Binlog entries derived from dialog data, erased when the dialog store is recreated.
const DIALOG_DEPENDENT_PREFIXES: &[&str] = &[
    "pinned_dialog_ids",
    "last_server_dialog_date",
    "unread_message_count",
    "unread_dialog_count",
    "top_dialogs#",
    "dlds#",
    "public_channels",
    "saved_messages_tags",
];

const DIALOG_DEPENDENT_KEYS: &[&str] = &[
    "sponsored_dialog_id",
    "dlds_counter",
    "fetched_marks_as_unread",
    "channels_to_send_stories",
];

/// Counters that are meaningless without an existing SQL file.
const FRESH_DATABASE_STALE_KEYS: &[&str] = &[
    "next_contacts_sync_date",
    "saved_contact_count",
    "old_featured_sticker_set_count",
    "invalidate_old_featured_sticker_sets",
];

// ─────────────────────────────────────────────────────────────────────────────
// Opening
// ─────────────────────────────────────────────────────────────────────────────

struct SqliteInit {
    pool: Arc<ConnectionPool>,
    was_dialog_db_created: bool,
}

/// Keys for opening the SQL file, derived from the binlog.
struct SqliteKeys {
    new_key: DbKey,
    old_key: DbKey,
    drop_stored_key: bool,
}

fn sqlite_keys(encrypt: bool, binlog_pmc: &BinlogKeyValue) -> Result<SqliteKeys> {
    let stored = binlog_pmc.get(SQLITE_KEY).filter(|key| !key.is_empty());
    if encrypt {
        let new_key = match stored.as_deref().and_then(DbKey::raw_from_slice) {
            Some(key) => key,
            None => {
                if stored.is_some() {
                    tracing::warn!("stored database key is malformed, generating a new one");
                } else {
                    tracing::info!("generating database key");
                }
                let key = DbKey::generate_raw();
                binlog_pmc.set(SQLITE_KEY, Bytes::copy_from_slice(key.as_bytes()))?;
                binlog_pmc.force_sync()?;
                key
            }
        };
        return Ok(SqliteKeys {
            new_key,
            old_key: DbKey::Empty,
            drop_stored_key: false,
        });
    }

    let old_key = stored.as_deref().and_then(DbKey::raw_from_slice).unwrap_or(DbKey::Empty);
    Ok(SqliteKeys {
        new_key: DbKey::Empty,
        drop_stored_key: stored.is_some(),
        old_key,
    })
}

fn init_store<S: StoreSchema>(
    db: &SqliteDb,
    enabled: bool,
    user_version: i32,
    kv_updates: &mut Vec<(String, String)>,
) -> Result<bool> {
    if !enabled {
        SchemaManager::drop_store::<S>(db, user_version)?;
        return Ok(false);
    }
    let report = SchemaManager::migrate::<S>(db, user_version)?;
    if report.changed_schema() {
        tracing::info!(
            store = report.store,
            created = report.was_created,
            steps = ?report.applied_steps,
            "store schema updated"
        );
    }
    kv_updates.extend(report.kv_updates);
    Ok(report.was_created)
}

/// Migrate every store inside the open transaction. Returns whether the
/// dialog store was created.
fn migrate_stores(db: &SqliteDb, config: &DatabaseConfig, binlog_pmc: &BinlogKeyValue) -> Result<bool> {
    let user_version = db.user_version()?;
    tracing::info!(user_version, "initializing database schema");

    let use_message_db = config.use_message_database;
    let mut kv_updates = Vec::new();
    let was_dialog_db_created = init_store::<DialogSchema>(db, use_message_db, user_version, &mut kv_updates)?;
    init_store::<MessageThreadSchema>(db, config.use_message_thread_database, user_version, &mut kv_updates)?;
    init_store::<MessageSchema>(db, use_message_db, user_version, &mut kv_updates)?;
    init_store::<StorySchema>(db, use_message_db, user_version, &mut kv_updates)?;
    init_store::<DownloadsSchema>(db, config.use_downloads_database, user_version, &mut kv_updates)?;

    let current = SchemaVersion::CURRENT.get();
    if user_version != current {
        tracing::warn!(from = user_version, to = current, "setting database user_version");
        db.set_user_version(current)?;
    }

    if was_dialog_db_created {
        for prefix in DIALOG_DEPENDENT_PREFIXES {
            binlog_pmc.erase_by_prefix(prefix)?;
        }
        for key in DIALOG_DEPENDENT_KEYS {
            binlog_pmc.erase(key)?;
        }
    }
    if user_version == 0 {
        for key in FRESH_DATABASE_STALE_KEYS {
            binlog_pmc.erase(key)?;
        }
    }
    for (key, value) in kv_updates {
        binlog_pmc.set(&key, value)?;
    }
    binlog_pmc.force_sync()?;
    Ok(was_dialog_db_created)
}

fn init_sqlite(config: &DatabaseConfig, keys: &SqliteKeys, binlog_pmc: &BinlogKeyValue) -> Result<SqliteInit> {
    let path = config.sqlite_path();
    let mut db = SqliteDb::change_key(&path, true, &keys.new_key, &keys.old_key)?;
    db.apply_session_pragmas()?;

    db.begin_write_transaction()?;
    let was_dialog_db_created = match migrate_stores(&db, config, binlog_pmc) {
        Ok(created) => created,
        Err(err) => {
            if let Err(rollback) = db.rollback_transaction() {
                tracing::warn!(error = %rollback, "rollback after failed migration failed");
            }
            return Err(err);
        }
    };
    db.commit_transaction()?;

    let cipher_version = db.cipher_version();
    let pool = ConnectionPool::new(ConnectionFactory::new(path, keys.new_key.clone(), cipher_version));
    pool.set(db)?;
    Ok(SqliteInit {
        pool,
        was_dialog_db_created,
    })
}

fn map_binlog_open_error(err: BinlogError) -> DatabaseError {
    match err {
        BinlogError::WrongPassword => DatabaseError::WrongKey,
        other => DatabaseError::Binlog(other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Database
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct AsyncStores {
    pub(crate) message: Option<MessageDbAsync>,
    pub(crate) dialog: Option<DialogDbAsync>,
    pub(crate) story: Option<StoryDbAsync>,
    pub(crate) message_thread: Option<MessageThreadDbAsync>,
    pub(crate) downloads: Option<DownloadsDbAsync>,
}

impl AsyncStores {
    pub(crate) fn lifecycles(&self) -> Vec<Arc<dyn Lifecycle>> {
        let mut lifecycles = Vec::new();
        if let Some(db) = &self.message {
            lifecycles.push(db.lifecycle());
        }
        if let Some(db) = &self.message_thread {
            lifecycles.push(db.lifecycle());
        }
        if let Some(db) = &self.dialog {
            lifecycles.push(db.lifecycle());
        }
        if let Some(db) = &self.story {
            lifecycles.push(db.lifecycle());
        }
        if let Some(db) = &self.downloads {
            lifecycles.push(db.lifecycle());
        }
        lifecycles
    }
}

/// The running database: binlog, key-value stores and asynchronous stores.
pub struct Database {
    pub(crate) config: DatabaseConfig,
    pub(crate) binlog: SharedBinlog,
    pub(crate) binlog_pmc: Arc<BinlogKeyValue>,
    pub(crate) config_pmc: Arc<BinlogKeyValue>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) stores: AsyncStores,
    pub(crate) was_dialog_db_created: bool,
}

impl Database {
    /// Open the binlog and the SQL file described by `config`.
    ///
    /// Message payloads are expected to start with their date, see
    /// [`PrefixedDateDecoder`].
    pub fn open(config: DatabaseConfig) -> Result<ReplayPhase> {
        Self::open_with_decoder(config, Arc::new(PrefixedDateDecoder))
    }

    /// Like [`open`](Self::open), with a custom message date decoder.
    pub fn open_with_decoder(config: DatabaseConfig, decoder: Arc<dyn MessageDateDecoder>) -> Result<ReplayPhase> {
        config.validate()?;
        fs::create_dir_all(&config.database_directory)?;
        tracing::info!(directory = %config.database_directory.display(), "opening database");

        let database_key = config.database_key();
        let encrypt = !database_key.is_empty();
        let mut binlog_loader = KeyValueLoader::new(HandlerType::BINLOG_PMC_MAGIC);
        let mut config_loader = KeyValueLoader::new(HandlerType::CONFIG_PMC_MAGIC);
        let mut events: BTreeMap<HandlerType, Vec<BinlogEvent>> = BTreeMap::new();
        let mut load_error = None;

        let binlog = Binlog::open_with_kdf(config.binlog_path(), database_key, config.binlog_kdf, |event| {
            let handled = match event.handler_type {
                HandlerType::BINLOG_PMC_MAGIC => binlog_loader.handle(event),
                HandlerType::CONFIG_PMC_MAGIC => config_loader.handle(event),
                HandlerType::EMPTY => Ok(()),
                other => {
                    events.entry(other).or_default().push(event.clone());
                    Ok(())
                }
            };
            if let Err(err) = handled {
                load_error.get_or_insert(err);
            }
        })
        .map_err(map_binlog_open_error)?;
        if let Some(err) = load_error {
            return Err(err.into());
        }

        let binlog = SharedBinlog::new(binlog);
        let binlog_pmc = Arc::new(binlog_loader.finish(binlog.clone())?);
        let config_pmc = Arc::new(config_loader.finish(binlog.clone())?);
        tracing::debug!(
            binlog_pmc = binlog_pmc.len(),
            config_pmc = config_pmc.len(),
            pending_event_types = events.len(),
            "binlog loaded"
        );

        let sqlite_path = config.sqlite_path();
        if config.drop_unauthorized_cache && binlog_pmc.get(AUTH_KEY).map_or(true, |auth| auth.is_empty()) {
            tracing::info!(path = %sqlite_path.display(), "destroying database of an unauthorized session");
            SqliteDb::destroy(&sqlite_path)?;
        }

        let keys = sqlite_keys(encrypt, &binlog_pmc)?;
        let init = match init_sqlite(&config, &keys, &binlog_pmc) {
            Ok(init) => init,
            Err(err) => {
                tracing::error!(error = %err, path = %sqlite_path.display(), "destroying bad database");
                SqliteDb::destroy(&sqlite_path)?;
                init_sqlite(&config, &keys, &binlog_pmc)?
            }
        };
        if keys.drop_stored_key {
            tracing::info!("database is no longer encrypted, dropping its key");
            binlog_pmc.erase(SQLITE_KEY)?;
        }

        let stores = if config.use_message_database {
            SyncStores {
                message: Some(MessageDb::new(init.pool.worker(), decoder)),
                dialog: Some(DialogDb::new(init.pool.worker())),
                story: Some(StoryDb::new(init.pool.worker())),
                message_thread: config
                    .use_message_thread_database
                    .then(|| MessageThreadDb::new(init.pool.worker())),
                downloads: None,
            }
        } else {
            SyncStores::default()
        };
        let stores = SyncStores {
            downloads: config
                .use_downloads_database
                .then(|| DownloadsDb::new(init.pool.worker())),
            ..stores
        };

        Ok(ReplayPhase {
            config,
            binlog,
            binlog_pmc,
            config_pmc,
            events,
            stores,
            pool: init.pool,
            was_dialog_db_created: init.was_dialog_db_created,
        })
    }

    /// Delete the files described by `config` without opening them.
    pub fn destroy(config: &DatabaseConfig) -> Result<()> {
        config.validate()?;
        tracing::info!(directory = %config.database_directory.display(), "destroying database files");
        SqliteDb::destroy(&config.sqlite_path())?;
        Binlog::destroy(config.binlog_path())?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn message_db(&self) -> Result<&MessageDbAsync> {
        self.stores.message.as_ref().ok_or(DatabaseError::StoreDisabled("message"))
    }

    pub fn dialog_db(&self) -> Result<&DialogDbAsync> {
        self.stores.dialog.as_ref().ok_or(DatabaseError::StoreDisabled("dialog"))
    }

    pub fn story_db(&self) -> Result<&StoryDbAsync> {
        self.stores.story.as_ref().ok_or(DatabaseError::StoreDisabled("story"))
    }

    pub fn message_thread_db(&self) -> Result<&MessageThreadDbAsync> {
        self.stores
            .message_thread
            .as_ref()
            .ok_or(DatabaseError::StoreDisabled("message thread"))
    }

    pub fn downloads_db(&self) -> Result<&DownloadsDbAsync> {
        self.stores
            .downloads
            .as_ref()
            .ok_or(DatabaseError::StoreDisabled("downloads"))
    }

    pub fn binlog(&self) -> &SharedBinlog {
        &self.binlog
    }

    pub fn binlog_pmc(&self) -> &Arc<BinlogKeyValue> {
        &self.binlog_pmc
    }

    pub fn config_pmc(&self) -> &Arc<BinlogKeyValue> {
        &self.config_pmc
    }

    pub fn was_dialog_db_created(&self) -> bool {
        self.was_dialog_db_created
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Re-encrypt the binlog. The SQL key lives inside it and is unchanged.
    pub fn change_database_encryption_key(&mut self, new_key: Option<String>) -> Result<()> {
        let mut config = self.config.clone();
        config.encryption_key = new_key;
        let key = config.database_key();
        tracing::info!(encrypted = !key.is_empty(), "changing database encryption key");
        self.binlog.change_key(key)?;
        self.config = config;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flushing and closing
    // ─────────────────────────────────────────────────────────────────────────

    /// Commit every pending write batch and sync the binlog.
    pub async fn flush_all(&self) -> Result<()> {
        tracing::debug!("flushing all databases");
        for store in self.stores.lifecycles() {
            store.force_flush().await?;
        }
        let binlog = self.binlog.clone();
        tokio::task::spawn_blocking(move || binlog.force_sync())
            .await
            .map_err(|e| DatabaseError::Task(e.to_string()))??;
        Ok(())
    }

    /// Close every store and the binlog, keeping the files.
    pub async fn close_all(self) -> Result<()> {
        self.shutdown(false).await
    }

    /// Close every store and the binlog, then delete all files.
    pub async fn close_and_destroy_all(self) -> Result<()> {
        self.shutdown(true).await
    }

    async fn shutdown(self, destroy: bool) -> Result<()> {
        tracing::info!(destroy, "closing all databases");
        let mut closing = JoinSet::new();
        for store in self.stores.lifecycles() {
            closing.spawn(async move {
                let name = store.name();
                store.close().await.map_err(DatabaseError::from).map(|()| name)
            });
        }
        let binlog = self.binlog.clone();
        closing.spawn(async move {
            tokio::task::spawn_blocking(move || {
                if destroy {
                    binlog.close_and_destroy()
                } else {
                    binlog.close()
                }
            })
            .await
            .map_err(|e| DatabaseError::Task(e.to_string()))??;
            Ok::<_, DatabaseError>("binlog")
        });

        let mut first_error = None;
        while let Some(joined) = closing.join_next().await {
            match joined.map_err(|e| DatabaseError::Task(e.to_string())).and_then(|closed| closed) {
                Ok(name) => tracing::debug!(store = name, "closed"),
                Err(err) => {
                    tracing::warn!(error = %err, "close failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if destroy {
            self.pool.close_and_destroy()?;
            remove_directory_if_empty(&self.config.database_directory);
        } else {
            self.pool.close();
        }
        tracing::info!(destroy, "all databases closed");
        first_error.map_or(Ok(()), Err)
    }
}

fn remove_directory_if_empty(directory: &Path) {
    let is_empty = fs::read_dir(directory).map(|mut entries| entries.next().is_none());
    if let Ok(true) = is_empty {
        if let Err(err) = fs::remove_dir(directory) {
            tracing::debug!(directory = %directory.display(), error = %err, "database directory kept");
        }
    }
}
