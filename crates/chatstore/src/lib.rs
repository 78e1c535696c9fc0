//! # Chatstore
//!
//! The local persistence layer of a messaging client: an encrypted binlog,
//! a SQLite file with the message, dialog, story, thread and download
//! stores, and the lifecycle that ties them together.
//!
//! ## Overview
//!
//! Opening a database is a two-step affair:
//!
//! 1. [`Database::open`] opens the binlog, rebuilds the binlog key-value
//!    stores, derives the SQL key, migrates every store in one transaction
//!    and returns a [`ReplayPhase`].
//! 2. The caller replays the remaining binlog events into the synchronous
//!    stores ([`ReplayPhase::run`]) and the phase turns into a running
//!    [`Database`] whose stores each live on their own worker.
//!
//! ## Key Types
//!
//! - [`DatabaseConfig`] - Location, encryption key and enabled stores
//! - [`ReplayPhase`] - Opened database before any store accepts requests
//! - [`ReplayHandler`] - Consumer of one type of replayed binlog event
//! - [`Database`] - Running database with flush and close fan-out
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatstore::{Database, DatabaseConfig};
//! use chatstore::core::{DialogId, FolderId};
//!
//! async fn example() -> chatstore::Result<()> {
//!     let config = DatabaseConfig::new("/var/lib/chat").with_encryption_key("hunter2");
//!     let database = Database::open(config)?.run(&mut [])?;
//!
//!     database
//!         .dialog_db()?
//!         .add_dialog(DialogId::new(1), FolderId::MAIN, 10, "summary".into(), Vec::new())
//!         .await?;
//!
//!     database.flush_all().await?;
//!     database.close_all().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `chatstore::core` - Ids, records and queries
//! - `chatstore::store` - SQLite stores and workers
//! - `chatstore::binlog` - Binlog and key-value stores

pub mod config;
pub mod database;
pub mod error;
pub mod replay;

pub use chatstore_binlog as binlog;
pub use chatstore_core as core;
pub use chatstore_store as store;

pub use config::DatabaseConfig;
pub use database::{Database, AUTH_KEY, SQLITE_KEY};
pub use error::{DatabaseError, Result};
pub use replay::{ReplayContext, ReplayHandler, ReplayPhase, SyncStores};
