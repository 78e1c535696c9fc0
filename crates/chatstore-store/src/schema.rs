//! Versioned schema management.
//!
//! All stores share one `user_version` counter stored in the database file.
//! Each store describes its schema as a [`StoreSchema`]: the DDL for a fresh
//! install plus a ladder of [`MigrationStep`]s, each tagged with the
//! [`SchemaVersion`] that introduced it. [`SchemaManager::migrate`] runs a
//! store forward from the stored version inside the caller's transaction.
//!
//! Every step is idempotent (`IF NOT EXISTS` guards), so a store that is
//! already at [`SchemaVersion::CURRENT`] migrates without executing any DDL.

use std::fmt;

use crate::error::{Result, StoreError};
use crate::sqlite_db::SqliteDb;

/// Schema versions, in the order they were introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum SchemaVersion {
    DialogDbCreated = 3,
    AddMessageDbMediaIndex = 4,
    AddMessageDb30MediaIndex = 5,
    AddMessageDbFts = 6,
    AddMessagesCallIndex = 7,
    AddNotificationsSupport = 8,
    AddFolders = 9,
    AddScheduledMessages = 10,
    StorePinnedDialogsInBinlog = 11,
    AddMessageThreadSupport = 12,
    AddMessageThreadDatabase = 13,
    AddStoryDatabase = 14,
    AddDownloadsDatabase = 15,
}

impl SchemaVersion {
    /// Version written to every file this build opens.
    pub const CURRENT: Self = Self::AddDownloadsDatabase;

    pub const fn get(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.get())
    }
}

/// Side effects a migration asks the caller to apply outside SQL.
#[derive(Debug, Default)]
pub struct MigrationContext {
    /// Binlog key-value pairs to write once the migration commits.
    pub kv_updates: Vec<(String, String)>,
}

/// One rung of a store's upgrade ladder.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub version: SchemaVersion,
    pub name: &'static str,
    pub apply: fn(&SqliteDb, &mut MigrationContext) -> Result<()>,
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// Schema description of one store kind.
pub trait StoreSchema {
    /// Name used in logs and reports.
    const NAME: &'static str;

    /// Table whose presence means the store exists.
    const MAIN_TABLE: &'static str;

    /// Every table the store owns, virtual tables included.
    const TABLES: &'static [&'static str];

    /// Whether the store exists in the file.
    fn is_present(db: &SqliteDb) -> Result<bool> {
        db.has_table(Self::MAIN_TABLE)
    }

    /// Create the schema of [`SchemaVersion::CURRENT`] from scratch.
    fn create(db: &SqliteDb) -> Result<()>;

    /// Upgrade ladder, ordered by version.
    fn steps() -> Vec<MigrationStep> {
        Vec::new()
    }
}

/// What a migration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub store: &'static str,
    pub from_version: i32,
    pub was_created: bool,
    pub applied_steps: Vec<&'static str>,
    pub kv_updates: Vec<(String, String)>,
}

impl MigrationReport {
    /// Whether any DDL ran.
    pub fn changed_schema(&self) -> bool {
        self.was_created || !self.applied_steps.is_empty()
    }
}

/// Runs store schemas forward. Must be called inside a transaction.
pub struct SchemaManager;

impl SchemaManager {
    /// Bring `S` up to [`SchemaVersion::CURRENT`] from `stored_version`.
    pub fn migrate<S: StoreSchema>(db: &SqliteDb, stored_version: i32) -> Result<MigrationReport> {
        tracing::info!(store = S::NAME, version = stored_version, "init store schema");

        let mut version = stored_version;
        if !S::is_present(db)? {
            Self::drop_tables::<S>(db)?;
            version = 0;
        } else if version < 0 || version > SchemaVersion::CURRENT.get() {
            tracing::warn!(
                store = S::NAME,
                version,
                current = SchemaVersion::CURRENT.get(),
                "unsupported schema version, recreating store"
            );
            Self::drop_tables::<S>(db)?;
            version = 0;
        }

        let mut report = MigrationReport {
            store: S::NAME,
            from_version: stored_version,
            was_created: false,
            applied_steps: Vec::new(),
            kv_updates: Vec::new(),
        };

        if version == 0 {
            tracing::info!(store = S::NAME, "creating store schema");
            S::create(db).map_err(|err| migration_error::<S>("create", err))?;
            report.was_created = true;
            version = SchemaVersion::CURRENT.get();
        }

        let mut context = MigrationContext::default();
        for step in S::steps() {
            if version < step.version.get() {
                tracing::info!(store = S::NAME, step = step.name, to = %step.version, "applying migration");
                (step.apply)(db, &mut context).map_err(|err| migration_error::<S>(step.name, err))?;
                report.applied_steps.push(step.name);
            }
        }
        report.kv_updates = context.kv_updates;
        Ok(report)
    }

    /// Remove all of `S`'s tables.
    pub fn drop_store<S: StoreSchema>(db: &SqliteDb, stored_version: i32) -> Result<()> {
        if stored_version != 0 && S::is_present(db)? {
            tracing::warn!(store = S::NAME, version = stored_version, "dropping store");
        }
        Self::drop_tables::<S>(db)
    }

    fn drop_tables<S: StoreSchema>(db: &SqliteDb) -> Result<()> {
        for table in S::TABLES {
            db.exec(&format!("DROP TABLE IF EXISTS {}", table))?;
        }
        Ok(())
    }
}

fn migration_error<S: StoreSchema>(step: &str, err: StoreError) -> StoreError {
    StoreError::Migration(format!("{} store, step {}: {}", S::NAME, step, err))
}

/// Names of all user objects of the given type, sorted.
pub fn schema_objects(db: &SqliteDb, kind: &str) -> Result<Vec<String>> {
    let mut stmt =
        db.prepare("SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name")?;
    let names = stmt
        .query_map([kind], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ToySchema;

    impl StoreSchema for ToySchema {
        const NAME: &'static str = "toy";
        const MAIN_TABLE: &'static str = "toys";
        const TABLES: &'static [&'static str] = &["toys"];

        fn create(db: &SqliteDb) -> Result<()> {
            db.exec("CREATE TABLE IF NOT EXISTS toys (id INT8 PRIMARY KEY, color STRING)")
        }

        fn steps() -> Vec<MigrationStep> {
            vec![MigrationStep {
                version: SchemaVersion::AddFolders,
                name: "add_color",
                apply: |db, ctx| {
                    db.exec("ALTER TABLE toys ADD COLUMN color STRING")?;
                    ctx.kv_updates.push(("toy_color".into(), "added".into()));
                    Ok(())
                },
            }]
        }
    }

    #[test]
    fn test_versions_are_ordered() {
        assert!(SchemaVersion::DialogDbCreated < SchemaVersion::CURRENT);
        assert_eq!(SchemaVersion::CURRENT.get(), 15);
    }

    #[test]
    fn test_fresh_create_skips_ladder() {
        let db = SqliteDb::open_in_memory().unwrap();
        let report = SchemaManager::migrate::<ToySchema>(&db, 0).unwrap();
        assert!(report.was_created);
        assert!(report.applied_steps.is_empty());
        assert!(db.has_table("toys").unwrap());
    }

    #[test]
    fn test_old_version_runs_step() {
        let db = SqliteDb::open_in_memory().unwrap();
        db.exec("CREATE TABLE toys (id INT8 PRIMARY KEY)").unwrap();
        let report = SchemaManager::migrate::<ToySchema>(&db, 5).unwrap();
        assert!(!report.was_created);
        assert_eq!(report.applied_steps, vec!["add_color"]);
        assert_eq!(report.kv_updates, vec![("toy_color".to_string(), "added".to_string())]);
        db.execute("INSERT INTO toys VALUES (1, 'red')", []).unwrap();
    }

    #[test]
    fn test_future_version_recreates() {
        let db = SqliteDb::open_in_memory().unwrap();
        db.exec("CREATE TABLE toys (id INT8 PRIMARY KEY, junk BLOB); INSERT INTO toys VALUES (1, x'00');")
            .unwrap();
        let report = SchemaManager::migrate::<ToySchema>(&db, 99).unwrap();
        assert!(report.was_created);
        let count: i64 = db.query_row("SELECT count(*) FROM toys", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_current_version_is_noop() {
        let db = SqliteDb::open_in_memory().unwrap();
        SchemaManager::migrate::<ToySchema>(&db, 0).unwrap();
        let report = SchemaManager::migrate::<ToySchema>(&db, SchemaVersion::CURRENT.get()).unwrap();
        assert!(!report.changed_schema());
    }

    #[test]
    fn test_failed_step_is_migration_error() {
        let db = SqliteDb::open_in_memory().unwrap();
        // The column already exists, so the ALTER fails.
        db.exec("CREATE TABLE toys (id INT8 PRIMARY KEY, color STRING)").unwrap();
        let err = SchemaManager::migrate::<ToySchema>(&db, 4).unwrap_err();
        assert!(matches!(err, StoreError::Migration(_)));
    }

    #[test]
    fn test_drop_removes_tables() {
        let db = SqliteDb::open_in_memory().unwrap();
        SchemaManager::migrate::<ToySchema>(&db, 0).unwrap();
        SchemaManager::drop_store::<ToySchema>(&db, SchemaVersion::CURRENT.get()).unwrap();
        assert!(!db.has_table("toys").unwrap());
    }
}
