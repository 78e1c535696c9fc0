//! Key-value store kept in the binlog.
//!
//! Each key lives in exactly one binlog event tagged with the store's magic.
//! Changing a value rewrites that event and erasing the key erases it, so the
//! binlog's reindexing keeps the file proportional to the live map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BinlogError, Result};
use crate::event::{BinlogEvent, HandlerType};
use crate::shared::SharedBinlog;

/// Payload of one key-value event, CBOR encoded.
#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    key: String,
    value: Bytes,
}

pub(crate) fn encode_entry(key: &str, value: &Bytes) -> Result<Vec<u8>> {
    let entry = KvEntry {
        key: key.to_string(),
        value: value.clone(),
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&entry, &mut buf).map_err(|e| BinlogError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_entry(data: &[u8]) -> Result<KvEntry> {
    ciborium::from_reader(data).map_err(|e| BinlogError::Serialization(e.to_string()))
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    event_id: u64,
}

/// Collects key-value events during binlog replay.
#[derive(Debug)]
pub struct KeyValueLoader {
    magic: HandlerType,
    entries: HashMap<String, Entry>,
    stale: Vec<u64>,
}

impl KeyValueLoader {
    pub fn new(magic: HandlerType) -> Self {
        Self {
            magic,
            entries: HashMap::new(),
            stale: Vec::new(),
        }
    }

    pub fn magic(&self) -> HandlerType {
        self.magic
    }

    /// Take one replayed event. Later events for a key win.
    pub fn handle(&mut self, event: &BinlogEvent) -> Result<()> {
        let entry = decode_entry(&event.data)?;
        let replaced = self.entries.insert(
            entry.key,
            Entry {
                value: entry.value,
                event_id: event.id,
            },
        );
        if let Some(old) = replaced {
            self.stale.push(old.event_id);
        }
        Ok(())
    }

    /// Erase events shadowed by a later one for the same key and attach the
    /// map to the binlog.
    pub fn finish(self, binlog: SharedBinlog) -> Result<BinlogKeyValue> {
        if !self.stale.is_empty() {
            tracing::debug!(magic = %self.magic, count = self.stale.len(), "erasing shadowed key-value events");
        }
        for id in self.stale {
            binlog.erase_event(id)?;
        }
        Ok(BinlogKeyValue {
            magic: self.magic,
            binlog,
            map: Mutex::new(self.entries),
        })
    }
}

/// String-keyed map persisted in a binlog.
#[derive(Debug)]
pub struct BinlogKeyValue {
    magic: HandlerType,
    binlog: SharedBinlog,
    map: Mutex<HashMap<String, Entry>>,
}

impl BinlogKeyValue {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn magic(&self) -> HandlerType {
        self.magic
    }

    pub fn binlog(&self) -> &SharedBinlog {
        &self.binlog
    }

    /// Store `value` under `key`. Setting the current value writes nothing.
    pub fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        let mut map = self.lock();
        let existing = map.get(key).map(|entry| (entry.event_id, entry.value == value));
        let data = match existing {
            Some((_, true)) => return Ok(()),
            _ => encode_entry(key, &value)?,
        };
        let event_id = match existing {
            Some((event_id, _)) => {
                self.binlog.rewrite_event(event_id, self.magic, data)?;
                event_id
            }
            None => self.binlog.add_event(self.magic, data)?,
        };
        map.insert(key.to_string(), Entry { value, event_id });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key).map(|entry| entry.value.clone())
    }

    /// The value as UTF-8, or `None` if missing or not text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|value| String::from_utf8(value.to_vec()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&self, key: &str) -> Result<bool> {
        let mut map = self.lock();
        let Some(entry) = map.get(key) else {
            return Ok(false);
        };
        self.binlog.erase_event(entry.event_id)?;
        map.remove(key);
        Ok(true)
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn erase_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut map = self.lock();
        let mut keys: Vec<String> = map.keys().filter(|key| key.starts_with(prefix)).cloned().collect();
        keys.sort();
        for key in &keys {
            if let Some(entry) = map.get(key) {
                self.binlog.erase_event(entry.event_id)?;
                map.remove(key);
            }
        }
        Ok(keys.len())
    }

    /// Entries whose key starts with `prefix`, keyed by the rest of the key.
    pub fn prefix_get(&self, prefix: &str) -> BTreeMap<String, Bytes> {
        self.lock()
            .iter()
            .filter_map(|(key, entry)| key.strip_prefix(prefix).map(|rest| (rest.to_string(), entry.value.clone())))
            .collect()
    }

    pub fn get_all(&self) -> BTreeMap<String, Bytes> {
        self.lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn force_sync(&self) -> Result<()> {
        self.binlog.force_sync()
    }
}
