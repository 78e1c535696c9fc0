//! # Chatstore Store
//!
//! SQLite persistence for the chatstore layer: one shared database file
//! holding the message, dialog, story, message thread and download stores.
//!
//! ## Overview
//!
//! Every store comes in two halves. A synchronous store ([`MessageDb`],
//! [`DialogDb`], ...) owns a [`WorkerConnection`] and runs prepared
//! statements directly. Its asynchronous twin ([`MessageDbAsync`], ...)
//! moves the synchronous store onto a dedicated worker thread that batches
//! writes into one transaction and answers reads after flushing them.
//!
//! Schemas are versioned as a single ladder ([`SchemaVersion`]) shared by
//! all stores. [`SchemaManager`] brings each store up to the current
//! version from whatever the file records.
//!
//! ## Key Types
//!
//! - [`SqliteDb`] - Connection wrapper with keyed open and nested transactions
//! - [`ConnectionPool`] - Hands one lazily opened connection to each worker
//! - [`SchemaManager`] - Creates, upgrades or drops a [`StoreSchema`]
//! - [`AsyncStore`] - Batching worker around any [`SyncStore`]
//! - [`Completion`] - Result of an asynchronous operation, awaitable or blocking
//!
//! ## Usage
//!
//! ```rust
//! use chatstore_core::{DialogId, FolderId};
//! use chatstore_store::{DialogDb, DialogSchema, SchemaManager, SqliteDb, WorkerConnection};
//!
//! let db = SqliteDb::open_in_memory().unwrap();
//! SchemaManager::migrate::<DialogSchema>(&db, 0).unwrap();
//!
//! let mut dialogs = DialogDb::new(WorkerConnection::detached(db));
//! dialogs.add_dialog(DialogId::new(7), FolderId::MAIN, 100, b"summary", &[]).unwrap();
//! assert_eq!(&dialogs.get_dialog(DialogId::new(7)).unwrap()[..], b"summary");
//! ```
//!
//! ## Design Notes
//!
//! - **One writer per store**: each async store owns its connection on one thread
//! - **Batched commits**: a flush wraps every pending write in one `BEGIN IMMEDIATE`
//! - **All or nothing**: a failing write rolls the whole batch back
//! - **Read your writes**: reads flush pending writes before running

pub mod dialog;
pub mod downloads;
pub mod error;
pub mod fts;
pub mod message;
pub mod pool;
pub mod schema;
pub mod sqlite_db;
pub mod story;
pub mod thread;
pub mod worker;

pub use dialog::{DialogDb, DialogDbAsync, DialogSchema, PINNED_DIALOG_IDS_KEY};
pub use downloads::{DownloadsDb, DownloadsDbAsync, DownloadsSchema};
pub use error::{Result, StoreError};
pub use message::{MessageDb, MessageDbAsync, MessageSchema};
pub use pool::{ConnectionFactory, ConnectionPool, WorkerConnection};
pub use schema::{MigrationContext, MigrationReport, MigrationStep, SchemaManager, SchemaVersion, StoreSchema};
pub use sqlite_db::SqliteDb;
pub use story::{StoryDb, StoryDbAsync, StorySchema};
pub use thread::{MessageThreadDb, MessageThreadDbAsync, MessageThreadSchema};
pub use worker::{AsyncStore, AsyncStoreStats, BatchConfig, Completion, Lifecycle, SyncStore};
