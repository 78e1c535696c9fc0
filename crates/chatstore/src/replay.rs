//! Startup replay of binlog events.
//!
//! Between opening the files and serving callers the database sits in a
//! [`ReplayPhase`]. The stores are still synchronous and owned by the phase;
//! the events read from the binlog are fed to [`ReplayHandler`]s in
//! dependency order. Only [`ReplayPhase::start`] moves the stores onto their
//! workers, so no asynchronous store exists while replay runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chatstore_binlog::{BinlogEvent, BinlogKeyValue, HandlerType, SharedBinlog};
use chatstore_store::{
    ConnectionPool, DialogDb, DialogDbAsync, DownloadsDb, DownloadsDbAsync, MessageDb, MessageDbAsync,
    MessageThreadDb, MessageThreadDbAsync, StoryDb, StoryDbAsync,
};

use crate::config::DatabaseConfig;
use crate::database::{AsyncStores, Database};
use crate::error::{DatabaseError, Result};

/// The synchronous stores, before they move onto their workers.
#[derive(Default)]
pub struct SyncStores {
    pub message: Option<MessageDb>,
    pub dialog: Option<DialogDb>,
    pub story: Option<StoryDb>,
    pub message_thread: Option<MessageThreadDb>,
    pub downloads: Option<DownloadsDb>,
}

impl SyncStores {
    pub fn message(&mut self) -> Result<&mut MessageDb> {
        self.message.as_mut().ok_or(DatabaseError::StoreDisabled("message"))
    }

    pub fn dialog(&mut self) -> Result<&mut DialogDb> {
        self.dialog.as_mut().ok_or(DatabaseError::StoreDisabled("dialog"))
    }

    pub fn story(&mut self) -> Result<&mut StoryDb> {
        self.story.as_mut().ok_or(DatabaseError::StoreDisabled("story"))
    }

    pub fn message_thread(&mut self) -> Result<&mut MessageThreadDb> {
        self.message_thread
            .as_mut()
            .ok_or(DatabaseError::StoreDisabled("message thread"))
    }

    pub fn downloads(&mut self) -> Result<&mut DownloadsDb> {
        self.downloads.as_mut().ok_or(DatabaseError::StoreDisabled("downloads"))
    }
}

/// What a handler can reach while replaying.
pub struct ReplayContext<'a> {
    pub stores: &'a mut SyncStores,
    pub binlog: &'a SharedBinlog,
    pub binlog_pmc: &'a BinlogKeyValue,
    pub config_pmc: &'a BinlogKeyValue,
}

/// Consumer of one type of replayed event.
pub trait ReplayHandler {
    fn handler_type(&self) -> HandlerType;

    fn replay(&mut self, ctx: &mut ReplayContext<'_>, event: &BinlogEvent) -> Result<()>;
}

/// An opened database whose stores have not started yet.
pub struct ReplayPhase {
    pub(crate) config: DatabaseConfig,
    pub(crate) binlog: SharedBinlog,
    pub(crate) binlog_pmc: Arc<BinlogKeyValue>,
    pub(crate) config_pmc: Arc<BinlogKeyValue>,
    pub(crate) events: BTreeMap<HandlerType, Vec<BinlogEvent>>,
    pub(crate) stores: SyncStores,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) was_dialog_db_created: bool,
}

impl ReplayPhase {
    /// Replayed events of one type, in log order.
    pub fn events(&self, handler_type: HandlerType) -> &[BinlogEvent] {
        self.events.get(&handler_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Event types read from the binlog that still await a handler.
    pub fn pending_handler_types(&self) -> Vec<HandlerType> {
        self.events.keys().copied().collect()
    }

    pub fn stores_mut(&mut self) -> &mut SyncStores {
        &mut self.stores
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

    /// Feed every event to its handler, then start the stores.
    ///
    /// Handlers run in slice order; each sees its events in log order. Any
    /// event type left without a handler fails the whole replay.
    pub fn run(mut self, handlers: &mut [&mut dyn ReplayHandler]) -> Result<Database> {
        let mut events = std::mem::take(&mut self.events);
        for handler in handlers.iter_mut() {
            let handler_type = handler.handler_type();
            let Some(batch) = events.remove(&handler_type) else {
                continue;
            };
            tracing::debug!(handler_type = %handler_type, events = batch.len(), "replaying events");
            let mut ctx = ReplayContext {
                stores: &mut self.stores,
                binlog: &self.binlog,
                binlog_pmc: &self.binlog_pmc,
                config_pmc: &self.config_pmc,
            };
            for event in &batch {
                handler.replay(&mut ctx, event).map_err(|err| match err {
                    DatabaseError::Replay(message) => DatabaseError::Replay(message),
                    other => DatabaseError::Replay(format!("event {} of type {}: {}", event.id, handler_type, other)),
                })?;
            }
        }

        if let Some((&handler_type, batch)) = events.iter().next() {
            tracing::error!(handler_type = %handler_type, count = batch.len(), "unhandled binlog events");
            return Err(DatabaseError::UnhandledEvent {
                handler_type,
                count: batch.len(),
            });
        }
        self.start()
    }

    /// Move every store onto its worker and open the database to callers.
    pub fn start(self) -> Result<Database> {
        let batch = self.config.batch;
        let SyncStores {
            message,
            dialog,
            story,
            message_thread,
            downloads,
        } = self.stores;

        let stores = AsyncStores {
            message: message.map(|db| MessageDbAsync::spawn(db, batch)).transpose()?,
            dialog: dialog.map(|db| DialogDbAsync::spawn(db, batch)).transpose()?,
            story: story.map(|db| StoryDbAsync::spawn(db, batch)).transpose()?,
            message_thread: message_thread
                .map(|db| MessageThreadDbAsync::spawn(db, batch))
                .transpose()?,
            downloads: downloads.map(|db| DownloadsDbAsync::spawn(db, batch)).transpose()?,
        };
        tracing::info!(
            directory = %self.config.database_directory.display(),
            stores = stores.lifecycles().len(),
            "database started"
        );

        Ok(Database {
            config: self.config,
            binlog: self.binlog,
            binlog_pmc: self.binlog_pmc,
            config_pmc: self.config_pmc,
            pool: self.pool,
            stores,
            was_dialog_db_created: self.was_dialog_db_created,
        })
    }
}
