//! A binlog shared between threads.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chatstore_core::DbKey;

use crate::binlog::{Binlog, BinlogInfo};
use crate::error::Result;
use crate::event::{BinlogEvent, HandlerType};

/// Cloneable handle to one [`Binlog`].
#[derive(Clone, Debug)]
pub struct SharedBinlog {
    inner: Arc<Mutex<Binlog>>,
}

impl SharedBinlog {
    pub fn new(binlog: Binlog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(binlog)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Binlog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the binlog.
    pub fn with<R>(&self, f: impl FnOnce(&mut Binlog) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn next_event_id(&self) -> u64 {
        self.lock().next_event_id()
    }

    pub fn add_event(&self, handler_type: HandlerType, data: impl Into<Bytes>) -> Result<u64> {
        self.lock().add_event(handler_type, data)
    }

    pub fn add_raw_event(&self, event: BinlogEvent) -> Result<()> {
        self.lock().add_raw_event(event)
    }

    pub fn rewrite_event(&self, id: u64, handler_type: HandlerType, data: impl Into<Bytes>) -> Result<()> {
        self.lock().rewrite_event(id, handler_type, data)
    }

    pub fn erase_event(&self, id: u64) -> Result<()> {
        self.lock().erase_event(id)
    }

    pub fn flush(&self) -> Result<()> {
        self.lock().flush()
    }

    pub fn force_sync(&self) -> Result<()> {
        self.lock().force_sync()
    }

    pub fn change_key(&self, new_key: DbKey) -> Result<()> {
        self.lock().change_key(new_key)
    }

    pub fn close(&self) -> Result<()> {
        self.lock().close()
    }

    pub fn close_and_destroy(&self) -> Result<()> {
        self.lock().close_and_destroy()
    }

    pub fn info(&self) -> BinlogInfo {
        self.lock().info()
    }

    pub fn size(&self) -> u64 {
        self.lock().size()
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path().to_path_buf()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("td.binlog");
        let shared = SharedBinlog::new(Binlog::open(&path, DbKey::Empty, |_| {}).unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        shared.add_event(HandlerType::new(9), vec![n]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.info().live_events, 100);
        assert_eq!(shared.info().last_event_id, 100);
        shared.close().unwrap();

        let mut count = 0;
        Binlog::open(&path, DbKey::Empty, |_| count += 1).unwrap();
        assert_eq!(count, 100);
    }
}
