//! # Chatstore Binlog
//!
//! Append-only event log with optional encryption, and the small durable
//! key-value stores built on top of it.
//!
//! ## Overview
//!
//! The binlog is the source of truth for metadata that must survive without
//! the SQL database: the SQL encryption key, pinned dialog lists, counters
//! and pending network events owned by other components. Events carry an id,
//! a [`HandlerType`] tag naming their owner and an opaque payload. Opening a
//! binlog replays every live event once, in id order.
//!
//! ## Key Types
//!
//! - [`Binlog`] - The log file: append, rewrite, erase, reindex, re-key
//! - [`SharedBinlog`] - Cloneable, thread-safe handle to a binlog
//! - [`BinlogKeyValue`] - String-keyed map stored as one event per key
//! - [`KeyValueLoader`] - Rebuilds a [`BinlogKeyValue`] during replay
//!
//! ## Usage
//!
//! ```rust
//! use chatstore_binlog::{Binlog, HandlerType, KeyValueLoader, SharedBinlog};
//! use chatstore_core::DbKey;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("td.binlog");
//!
//! let mut loader = KeyValueLoader::new(HandlerType::BINLOG_PMC_MAGIC);
//! let binlog = Binlog::open(&path, DbKey::Empty, |event| {
//!     if event.handler_type == loader.magic() {
//!         loader.handle(event).unwrap();
//!     }
//! })
//! .unwrap();
//!
//! let pmc = loader.finish(SharedBinlog::new(binlog)).unwrap();
//! pmc.set("auth", "ok").unwrap();
//! assert_eq!(pmc.get_str("auth").as_deref(), Some("ok"));
//! ```
//!
//! ## Design Notes
//!
//! - **Self-checking frames**: every frame carries a checksum; a torn tail is cut off on open
//! - **Per-event sealing**: encrypted files seal each event with its own nonce
//! - **Stretched passwords**: password keys go through Argon2id, at the cost recorded in the header
//! - **Atomic reindex**: compaction writes `<path>.new` and renames it into place; a failed rename leaves the old file open

pub mod binlog;
pub mod crypto;
pub mod error;
pub mod event;
pub mod format;
pub mod kv;
pub mod shared;

pub use binlog::{reindex_path, Binlog, BinlogInfo};
pub use crypto::KdfParams;
pub use error::{BinlogError, Result};
pub use event::{flags, BinlogEvent, HandlerType};
pub use kv::{BinlogKeyValue, KeyValueLoader};
pub use shared::SharedBinlog;
