//! # Chatstore Testkit
//!
//! Testing utilities for chatstore.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Temporary database directories, in-memory stores and record builders
//! - **Generators**: Proptest strategies for ids, filters, messages and key-value operations
//!
//! ## Test Fixtures
//!
//! Quickly set up a database in a temporary directory:
//!
//! ```rust,no_run
//! use chatstore_testkit::fixtures::TempDatabase;
//!
//! # async fn example() -> chatstore::Result<()> {
//! let fixture = TempDatabase::encrypted("hunter2");
//! let database = fixture.open();
//! database.binlog_pmc().set("auth", "ok")?;
//! database.close_all().await
//! # }
//! ```
//!
//! Or a single store without any file:
//!
//! ```rust
//! use chatstore::core::DialogId;
//! use chatstore_testkit::fixtures::{memory_message_db, searchable_message};
//!
//! let mut messages = memory_message_db();
//! messages.add_message(&searchable_message(DialogId::new(1), 10, 10, "hello")).unwrap();
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use chatstore_testkit::generators::{message_from_params, MessageParams};
//!
//! proptest! {
//!     #[test]
//!     fn stored_message_reads_back(params: MessageParams) {
//!         let mut db = chatstore_testkit::memory_message_db();
//!         let record = message_from_params(DialogId::new(1), &params);
//!         db.add_message(&record).unwrap();
//!         prop_assert!(db.get_message(record.dialog_id, record.message_id).is_ok());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, memory_message_db, TempDatabase};
pub use generators::{message_from_params, KvOp, MessageParams};
