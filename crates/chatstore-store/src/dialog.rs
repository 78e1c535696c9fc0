//! Dialog store: dialog summaries ordered within folders, plus the
//! notification groups of each dialog.

use std::sync::Arc;

use bytes::Bytes;
use chatstore_core::{
    DialogId, DialogsPage, FolderId, NotificationGroupId, NotificationGroupKey, NotificationGroupUpdate,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::pool::WorkerConnection;
use crate::schema::{MigrationStep, SchemaVersion, StoreSchema};
use crate::sqlite_db::SqliteDb;
use crate::worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};

/// Orders above this belong to pinned dialogs.
const MIN_PINNED_DIALOG_ORDER: i64 = 9_221_294_780_217_032_704;

/// Binlog key prefix for pinned dialog lists, followed by the folder id.
pub const PINNED_DIALOG_IDS_KEY: &str = "pinned_dialog_ids";

/// Schema of the dialog store.
pub struct DialogSchema;

impl StoreSchema for DialogSchema {
    const NAME: &'static str = "dialog";
    const MAIN_TABLE: &'static str = "dialogs";
    const TABLES: &'static [&'static str] = &["dialogs", "notification_groups"];

    fn create(db: &SqliteDb) -> Result<()> {
        db.exec(
            "CREATE TABLE IF NOT EXISTS dialogs (dialog_id INT8 PRIMARY KEY, dialog_order INT8, data BLOB, \
             folder_id INT4)",
        )?;
        create_notification_group_table(db)?;
        create_last_notification_date_index(db)?;
        add_dialogs_in_folder_index(db)
    }

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep {
                version: SchemaVersion::AddNotificationsSupport,
                name: "add_notification_groups",
                apply: |db, _| {
                    create_notification_group_table(db)?;
                    create_last_notification_date_index(db)
                },
            },
            MigrationStep {
                version: SchemaVersion::AddFolders,
                name: "add_folders",
                apply: |db, _| {
                    db.exec("DROP INDEX IF EXISTS dialog_by_dialog_order")?;
                    db.exec("ALTER TABLE dialogs ADD COLUMN folder_id INT4")?;
                    add_dialogs_in_folder_index(db)?;
                    db.exec("UPDATE dialogs SET folder_id = 0 WHERE dialog_id < -1500000000000 AND dialog_order > 0")
                },
            },
            MigrationStep {
                version: SchemaVersion::StorePinnedDialogsInBinlog,
                name: "store_pinned_dialogs_in_binlog",
                apply: |db, ctx| {
                    let mut stmt = db.prepare(
                        "SELECT dialog_id FROM dialogs WHERE folder_id = ?1 AND dialog_order > ?2 \
                         ORDER BY dialog_order DESC, dialog_id DESC",
                    )?;
                    for folder_id in [FolderId::MAIN, FolderId::ARCHIVE] {
                        let ids = stmt
                            .query_map(params![folder_id.get(), MIN_PINNED_DIALOG_ORDER], |row| {
                                row.get::<_, i64>(0)
                            })?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        let joined = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
                        ctx.kv_updates
                            .push((format!("{}{}", PINNED_DIALOG_IDS_KEY, folder_id.get()), joined));
                    }
                    Ok(())
                },
            },
        ]
    }
}

fn create_notification_group_table(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE TABLE IF NOT EXISTS notification_groups (notification_group_id INT4 PRIMARY KEY, dialog_id \
         INT8, last_notification_date INT4)",
    )
}

fn create_last_notification_date_index(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE INDEX IF NOT EXISTS notification_group_by_last_notification_date ON notification_groups \
         (last_notification_date, dialog_id, notification_group_id) WHERE last_notification_date IS NOT NULL",
    )
}

fn add_dialogs_in_folder_index(db: &SqliteDb) -> Result<()> {
    db.exec(
        "CREATE INDEX IF NOT EXISTS dialog_in_folder_by_dialog_order ON dialogs (folder_id, dialog_order, dialog_id) \
         WHERE folder_id IS NOT NULL",
    )
}

const ADD_DIALOG: &str = "INSERT OR REPLACE INTO dialogs VALUES(?1, ?2, ?3, ?4)";
const ADD_NOTIFICATION_GROUP: &str = "INSERT OR REPLACE INTO notification_groups VALUES(?1, ?2, ?3)";
const DELETE_NOTIFICATION_GROUP: &str = "DELETE FROM notification_groups WHERE notification_group_id = ?1";
const GET_DIALOG: &str = "SELECT data FROM dialogs WHERE dialog_id = ?1";
const GET_DIALOGS: &str = "SELECT data, dialog_id, dialog_order FROM dialogs WHERE \
     folder_id = ?1 AND (dialog_order < ?2 OR (dialog_order = ?2 AND dialog_id < ?3)) ORDER \
     BY dialog_order DESC, dialog_id DESC LIMIT ?4";
const GET_NOTIFICATION_GROUPS_BY_LAST_NOTIFICATION_DATE: &str =
    "SELECT notification_group_id, dialog_id, last_notification_date FROM notification_groups \
     WHERE last_notification_date < ?1 OR (last_notification_date = ?1 \
     AND (dialog_id < ?2 OR (dialog_id = ?2 AND notification_group_id < ?3))) ORDER BY \
     last_notification_date DESC, dialog_id DESC LIMIT ?4";
const GET_NOTIFICATION_GROUP: &str =
    "SELECT dialog_id, last_notification_date FROM notification_groups WHERE notification_group_id = ?1";
const GET_SECRET_CHAT_COUNT: &str =
    "SELECT COUNT(*) FROM dialogs WHERE folder_id = ?1 AND dialog_order > 0 AND dialog_id < -1500000000000";

/// `NULL` dates read back as 0.
fn last_notification_date(row: &Row<'_>, index: usize) -> rusqlite::Result<i32> {
    Ok(row.get::<_, Option<i32>>(index)?.unwrap_or(0))
}

/// Synchronous dialog store over one worker connection.
pub struct DialogDb {
    conn: WorkerConnection,
}

impl DialogDb {
    pub fn new(conn: WorkerConnection) -> Self {
        Self { conn }
    }

    fn db(&mut self) -> Result<&SqliteDb> {
        self.conn.get().map(|db| &*db)
    }

    /// Insert or replace a dialog and apply its notification group changes.
    ///
    /// Dialogs with a non-positive order are not listed in any folder.
    pub fn add_dialog(
        &mut self,
        dialog_id: DialogId,
        folder_id: FolderId,
        order: i64,
        data: &[u8],
        notification_groups: &[NotificationGroupUpdate],
    ) -> Result<()> {
        if !dialog_id.is_valid() {
            return Err(StoreError::InvalidArgument(format!("invalid dialog id {}", dialog_id)));
        }
        tracing::debug!(%dialog_id, %folder_id, order, groups = notification_groups.len(), "add dialog");

        let db = self.db()?;
        db.prepare_cached(ADD_DIALOG)?.execute(params![
            dialog_id.get(),
            order,
            data,
            (order > 0).then_some(folder_id.get()),
        ])?;

        for update in notification_groups {
            match update {
                NotificationGroupUpdate::Upsert(key) => {
                    let date = (key.last_notification_date != 0).then_some(key.last_notification_date);
                    db.prepare_cached(ADD_NOTIFICATION_GROUP)?
                        .execute(params![key.group_id.get(), key.dialog_id.get(), date])?;
                }
                NotificationGroupUpdate::Remove(group_id) => {
                    db.prepare_cached(DELETE_NOTIFICATION_GROUP)?
                        .execute([group_id.get()])?;
                }
            }
        }
        Ok(())
    }

    pub fn get_dialog(&mut self, dialog_id: DialogId) -> Result<Bytes> {
        self.db()?
            .prepare_cached(GET_DIALOG)?
            .query_row([dialog_id.get()], |row| row.get::<_, Vec<u8>>(0))
            .optional()?
            .map(Bytes::from)
            .ok_or_else(|| StoreError::NotFound(format!("dialog {}", dialog_id)))
    }

    /// Dialogs of a folder strictly after the cursor `(order, dialog_id)`,
    /// by descending order.
    pub fn get_dialogs(&mut self, folder_id: FolderId, order: i64, dialog_id: DialogId, limit: i32) -> Result<DialogsPage> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_DIALOGS)?;
        let mut rows = stmt.query(params![folder_id.get(), order, dialog_id.get(), limit])?;

        let mut page = DialogsPage {
            dialogs: Vec::new(),
            next_order: order,
            next_dialog_id: dialog_id,
        };
        while let Some(row) = rows.next()? {
            page.dialogs.push(Bytes::from(row.get::<_, Vec<u8>>(0)?));
            page.next_dialog_id = DialogId::new(row.get(1)?);
            page.next_order = row.get(2)?;
        }
        tracing::trace!(%folder_id, loaded = page.dialogs.len(), next_order = page.next_order, "load dialogs");
        Ok(page)
    }

    /// Notification groups strictly after `key`, newest first.
    pub fn get_notification_groups_by_last_notification_date(
        &mut self,
        key: NotificationGroupKey,
        limit: i32,
    ) -> Result<Vec<NotificationGroupKey>> {
        let db = self.db()?;
        let mut stmt = db.prepare_cached(GET_NOTIFICATION_GROUPS_BY_LAST_NOTIFICATION_DATE)?;
        let rows = stmt.query_map(
            params![key.last_notification_date, key.dialog_id.get(), key.group_id.get(), limit],
            |row| {
                Ok(NotificationGroupKey::new(
                    NotificationGroupId::new(row.get(0)?),
                    DialogId::new(row.get(1)?),
                    last_notification_date(row, 2)?,
                ))
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_notification_group(&mut self, group_id: NotificationGroupId) -> Result<NotificationGroupKey> {
        self.db()?
            .prepare_cached(GET_NOTIFICATION_GROUP)?
            .query_row([group_id.get()], |row| {
                Ok(NotificationGroupKey::new(
                    group_id,
                    DialogId::new(row.get(0)?),
                    last_notification_date(row, 1)?,
                ))
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("notification group {}", group_id)))
    }

    /// Number of listed secret chats in a folder.
    pub fn get_secret_chat_count(&mut self, folder_id: FolderId) -> Result<i32> {
        Ok(self
            .db()?
            .prepare_cached(GET_SECRET_CHAT_COUNT)?
            .query_row([folder_id.get()], |row| row.get(0))?)
    }
}

impl SyncStore for DialogDb {
    const NAME: &'static str = "dialog";

    fn connection(&mut self) -> Result<&mut SqliteDb> {
        self.conn.get()
    }
}

/// Asynchronous handle to a [`DialogDb`].
#[derive(Clone)]
pub struct DialogDbAsync {
    inner: AsyncStore<DialogDb>,
}

impl DialogDbAsync {
    pub fn spawn(db: DialogDb, config: BatchConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncStore::spawn(db, config)?,
        })
    }

    pub fn add_dialog(
        &self,
        dialog_id: DialogId,
        folder_id: FolderId,
        order: i64,
        data: Bytes,
        notification_groups: Vec<NotificationGroupUpdate>,
    ) -> Completion<()> {
        self.inner
            .write(move |db| db.add_dialog(dialog_id, folder_id, order, &data, &notification_groups))
    }

    pub fn get_dialog(&self, dialog_id: DialogId) -> Completion<Bytes> {
        self.inner.read(move |db| db.get_dialog(dialog_id))
    }

    pub fn get_dialogs(&self, folder_id: FolderId, order: i64, dialog_id: DialogId, limit: i32) -> Completion<DialogsPage> {
        self.inner
            .read(move |db| db.get_dialogs(folder_id, order, dialog_id, limit))
    }

    pub fn get_notification_groups_by_last_notification_date(
        &self,
        key: NotificationGroupKey,
        limit: i32,
    ) -> Completion<Vec<NotificationGroupKey>> {
        self.inner
            .read(move |db| db.get_notification_groups_by_last_notification_date(key, limit))
    }

    pub fn get_notification_group(&self, group_id: NotificationGroupId) -> Completion<NotificationGroupKey> {
        self.inner.read(move |db| db.get_notification_group(group_id))
    }

    pub fn get_secret_chat_count(&self, folder_id: FolderId) -> Completion<i32> {
        self.inner.read(move |db| db.get_secret_chat_count(folder_id))
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

    const SECRET: i64 = -1_500_000_000_001;

    fn new_db() -> DialogDb {
        let db = SqliteDb::open_in_memory().unwrap();
        SchemaManager::migrate::<DialogSchema>(&db, 0).unwrap();
        DialogDb::new(WorkerConnection::detached(db))
    }

    fn group(id: i32, dialog: i64, date: i32) -> NotificationGroupKey {
        NotificationGroupKey::new(NotificationGroupId::new(id), DialogId::new(dialog), date)
    }

    #[test]
    fn test_add_and_get_dialog() {
        let mut db = new_db();
        db.add_dialog(DialogId::new(1), FolderId::MAIN, 10, b"one", &[]).unwrap();
        assert_eq!(db.get_dialog(DialogId::new(1)).unwrap(), Bytes::from_static(b"one"));
        assert!(db.get_dialog(DialogId::new(2)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_dialog_pages_follow_cursor() {
        let mut db = new_db();
        for (id, order) in [(1, 10), (2, 30), (3, 20), (4, 20), (5, 0)] {
            db.add_dialog(DialogId::new(id), FolderId::MAIN, order, &[id as u8], &[]).unwrap();
        }
        db.add_dialog(DialogId::new(6), FolderId::ARCHIVE, 50, b"a", &[]).unwrap();

        let first = db.get_dialogs(FolderId::MAIN, i64::MAX, DialogId::new(i64::MAX), 2).unwrap();
        assert_eq!(first.dialogs, vec![Bytes::from_static(&[2]), Bytes::from_static(&[4])]);
        assert_eq!((first.next_order, first.next_dialog_id), (20, DialogId::new(4)));

        let second = db
            .get_dialogs(FolderId::MAIN, first.next_order, first.next_dialog_id, 10)
            .unwrap();
        // The dialog with order 0 is in no folder.
        assert_eq!(second.dialogs, vec![Bytes::from_static(&[3]), Bytes::from_static(&[1])]);

        let empty = db.get_dialogs(FolderId::MAIN, 0, DialogId::new(0), 10).unwrap();
        assert!(empty.dialogs.is_empty());
        assert_eq!(empty.next_order, 0);
    }

    #[test]
    fn test_notification_groups() {
        let mut db = new_db();
        db.add_dialog(
            DialogId::new(1),
            FolderId::MAIN,
            1,
            b"d",
            &[
                NotificationGroupUpdate::Upsert(group(1, 1, 100)),
                NotificationGroupUpdate::Upsert(group(2, 1, 0)),
                NotificationGroupUpdate::Upsert(group(3, 1, 200)),
            ],
        )
        .unwrap();

        assert_eq!(db.get_notification_group(NotificationGroupId::new(2)).unwrap(), group(2, 1, 0));
        let newest = db
            .get_notification_groups_by_last_notification_date(NotificationGroupKey::newest(), 10)
            .unwrap();
        assert_eq!(newest, vec![group(3, 1, 200), group(1, 1, 100)]);

        db.add_dialog(DialogId::new(1), FolderId::MAIN, 1, b"d", &[NotificationGroupUpdate::Remove(
            NotificationGroupId::new(3),
        )])
        .unwrap();
        assert!(db
            .get_notification_group(NotificationGroupId::new(3))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_secret_chat_count() {
        let mut db = new_db();
        db.add_dialog(DialogId::new(SECRET), FolderId::MAIN, 5, b"s", &[]).unwrap();
        db.add_dialog(DialogId::new(SECRET - 1), FolderId::MAIN, 0, b"s", &[]).unwrap();
        db.add_dialog(DialogId::new(7), FolderId::MAIN, 5, b"u", &[]).unwrap();
        assert_eq!(db.get_secret_chat_count(FolderId::MAIN).unwrap(), 1);
        assert_eq!(db.get_secret_chat_count(FolderId::ARCHIVE).unwrap(), 0);
    }

    #[test]
    fn test_migration_from_dialog_db_created() {
        let db = SqliteDb::open_in_memory().unwrap();
        db.exec(
            "CREATE TABLE dialogs (dialog_id INT8 PRIMARY KEY, dialog_order INT8, data BLOB);
             CREATE INDEX dialog_by_dialog_order ON dialogs (dialog_order, dialog_id);",
        )
        .unwrap();
        let pinned = MIN_PINNED_DIALOG_ORDER + 5;
        db.execute("INSERT INTO dialogs VALUES (?1, ?2, x'00')", params![SECRET, pinned]).unwrap();
        db.execute("INSERT INTO dialogs VALUES (8, 100, x'00')", []).unwrap();

        let report = SchemaManager::migrate::<DialogSchema>(&db, SchemaVersion::DialogDbCreated.get()).unwrap();
        assert!(!report.was_created);
        assert_eq!(
            report.applied_steps,
            vec!["add_notification_groups", "add_folders", "store_pinned_dialogs_in_binlog"]
        );
        assert_eq!(
            report.kv_updates,
            vec![
                ("pinned_dialog_ids0".to_string(), SECRET.to_string()),
                ("pinned_dialog_ids1".to_string(), String::new()),
            ]
        );
        assert!(db.has_table("notification_groups").unwrap());

        let mut store = DialogDb::new(WorkerConnection::detached(db));
        // Only secret chats were moved into the main folder.
        assert_eq!(store.get_secret_chat_count(FolderId::MAIN).unwrap(), 1);
        let page = store.get_dialogs(FolderId::MAIN, i64::MAX, DialogId::new(i64::MAX), 10).unwrap();
        assert_eq!(page.dialogs.len(), 1);
    }

    #[tokio::test]
    async fn test_async_dialog_roundtrip() {
        let store = DialogDbAsync::spawn(new_db(), BatchConfig::default()).unwrap();
        let write = store.add_dialog(DialogId::new(3), FolderId::MAIN, 9, Bytes::from_static(b"x"), Vec::new());
        assert_eq!(store.get_dialog(DialogId::new(3)).await.unwrap(), Bytes::from_static(b"x"));
        write.await.unwrap();
        store.close().await.unwrap();
    }
}
