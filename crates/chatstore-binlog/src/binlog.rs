//! The append-only event log.
//!
//! Every change is appended as a new frame. The live state (the last
//! version of each event id that has not been erased) is kept in memory and
//! handed to the caller once, in id order, when the file is opened. When the
//! file grows too large relative to the live state it is rewritten from
//! memory into `<path>.new` and renamed over the original.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chatstore_core::DbKey;

use crate::crypto::{generate_salt, BinlogCipher, KdfParams};
use crate::error::{BinlogError, Result};
use crate::event::{flags, BinlogEvent, HandlerType};
use crate::format::{self, FrameRead, Header, HEADER_LEN};

/// Buffered bytes that force a write to the file.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// `(min_size, ratio)`: reindex once the file is larger than `min_size`
/// and more than `ratio` times the size of the live events.
const REINDEX_THRESHOLDS: [(u64, u64); 4] = [(50_000, 5), (100_000, 4), (300_000, 3), (500_000, 2)];

/// Path of the file written during a reindex.
pub fn reindex_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

/// Facts about an open binlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogInfo {
    /// The file did not exist before this open.
    pub was_created: bool,
    pub last_event_id: u64,
    pub encrypted: bool,
    pub live_events: usize,
    /// Bytes of damaged tail dropped while opening.
    pub truncated_bytes: u64,
    pub is_opened: bool,
}

#[derive(Debug)]
struct LiveEvent {
    event: BinlogEvent,
    /// Size of the frame that holds this version on disk.
    size: u64,
}

/// An open binlog file.
pub struct Binlog {
    path: PathBuf,
    file: Option<File>,
    key: DbKey,
    /// Password cost for headers this binlog writes.
    password_kdf: KdfParams,
    header: Header,
    cipher: Option<BinlogCipher>,
    events: BTreeMap<u64, LiveEvent>,
    live_size: u64,
    file_size: u64,
    buffer: Vec<u8>,
    last_event_id: u64,
    need_sync: bool,
    info: BinlogInfo,
}

impl std::fmt::Debug for Binlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binlog")
            .field("path", &self.path)
            .field("encrypted", &self.cipher.is_some())
            .field("live_events", &self.events.len())
            .field("size", &self.size())
            .finish()
    }
}

impl Binlog {
    // ─────────────────────────────────────────────────────────────────────────
    // Opening
    // ─────────────────────────────────────────────────────────────────────────

    /// Open or create the binlog at `path`, calling `callback` with every
    /// live event in id order.
    pub fn open(path: impl AsRef<Path>, key: DbKey, callback: impl FnMut(&BinlogEvent)) -> Result<Self> {
        Self::open_with_kdf(path, key, KdfParams::PASSWORD, callback)
    }

    /// Like [`open`](Self::open), stretching passwords with `password_kdf`
    /// whenever a new header is written. Existing files keep the cost stored
    /// in their header until the key changes.
    pub fn open_with_kdf(
        path: impl AsRef<Path>,
        key: DbKey,
        password_kdf: KdfParams,
        mut callback: impl FnMut(&BinlogEvent),
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let new_path = reindex_path(&path);
        if !path.exists() && new_path.exists() {
            tracing::warn!(path = %path.display(), "restoring binlog from its reindexed copy");
            fs::rename(&new_path, &path)?;
        }

        let was_created = !path.exists();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut binlog = Self {
            path,
            file: None,
            key,
            password_kdf,
            header: Header::plaintext(),
            cipher: None,
            events: BTreeMap::new(),
            live_size: 0,
            file_size: 0,
            buffer: Vec::new(),
            last_event_id: 0,
            need_sync: false,
            info: BinlogInfo {
                was_created,
                ..BinlogInfo::default()
            },
        };

        if contents.len() < HEADER_LEN {
            if !contents.is_empty() {
                tracing::warn!(path = %binlog.path.display(), len = contents.len(), "discarding incomplete binlog header");
            }
            binlog.start_new_file(&mut file)?;
        } else {
            let header = Header::decode(&contents)?;
            if header.encrypted {
                let cipher =
                    BinlogCipher::derive(&binlog.key, &header.salt, header.kdf)?.ok_or(BinlogError::WrongPassword)?;
                if cipher.key_hash() != header.key_hash {
                    return Err(BinlogError::WrongPassword);
                }
                binlog.cipher = Some(cipher);
            }
            binlog.header = header;

            let valid_len = binlog.load(&contents);
            if valid_len < contents.len() {
                let dropped = (contents.len() - valid_len) as u64;
                tracing::warn!(
                    path = %binlog.path.display(),
                    old_size = contents.len(),
                    new_size = valid_len,
                    "truncating damaged binlog tail"
                );
                file.set_len(valid_len as u64)?;
                binlog.info.truncated_bytes = dropped;
            }
            binlog.file_size = valid_len as u64;
        }
        file.seek(SeekFrom::Start(binlog.file_size))?;
        binlog.file = Some(file);

        for live in binlog.events.values() {
            callback(&live.event);
        }

        if !binlog.key.is_empty() && binlog.cipher.is_none() {
            tracing::info!(path = %binlog.path.display(), "encrypting plaintext binlog");
            let (header, cipher) = header_for(&binlog.key, binlog.password_kdf)?;
            binlog.rewrite(header, cipher)?;
        }

        tracing::info!(
            path = %binlog.path.display(),
            events = binlog.events.len(),
            size = binlog.file_size,
            encrypted = binlog.cipher.is_some(),
            "binlog opened"
        );
        Ok(binlog)
    }

    fn start_new_file(&mut self, file: &mut File) -> Result<()> {
        let (header, cipher) = header_for(&self.key, self.password_kdf)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        self.header = header;
        self.cipher = cipher;
        self.file_size = HEADER_LEN as u64;
        Ok(())
    }

    /// Replay frames into memory. Returns the length of the intact prefix.
    fn load(&mut self, contents: &[u8]) -> usize {
        let mut offset = HEADER_LEN;
        loop {
            match format::read_frame(&contents[offset..]) {
                FrameRead::End => break,
                FrameRead::Damaged(reason) => {
                    tracing::warn!(offset, reason, "damaged binlog frame");
                    break;
                }
                FrameRead::Frame { payload, size } => {
                    let event = match self.decode_payload(payload) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(offset, error = %err, "undecodable binlog event");
                            break;
                        }
                    };
                    if event.is_rewrite() && !self.events.contains_key(&event.id) {
                        tracing::warn!(id = event.id, "rewrite of an event that is not live");
                    }
                    self.apply(event, size as u64);
                    offset += size;
                }
            }
        }
        offset
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<BinlogEvent> {
        match &self.cipher {
            Some(cipher) => BinlogEvent::decode(&cipher.open(payload)?),
            None => BinlogEvent::decode(payload),
        }
    }

    /// Fold one event into the live state.
    fn apply(&mut self, mut event: BinlogEvent, size: u64) {
        self.last_event_id = self.last_event_id.max(event.id);
        if event.is_rewrite() {
            if let Some(old) = self.events.remove(&event.id) {
                self.live_size -= old.size;
            }
            if event.handler_type == HandlerType::EMPTY {
                return;
            }
            event.flags &= !flags::REWRITE;
        }
        if let Some(old) = self.events.insert(event.id, LiveEvent { event, size }) {
            self.live_size -= old.size;
        }
        self.live_size += size;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Reserve the next event id.
    pub fn next_event_id(&mut self) -> u64 {
        self.last_event_id += 1;
        self.last_event_id
    }

    /// Append a new event and return its id.
    pub fn add_event(&mut self, handler_type: HandlerType, data: impl Into<Bytes>) -> Result<u64> {
        self.ensure_open()?;
        let id = self.next_event_id();
        self.append(BinlogEvent::new(id, handler_type, data))?;
        Ok(id)
    }

    /// Append a caller-built event, typically with an id from
    /// [`next_event_id`](Self::next_event_id).
    pub fn add_raw_event(&mut self, event: BinlogEvent) -> Result<()> {
        self.ensure_open()?;
        if event.is_rewrite() && !self.events.contains_key(&event.id) {
            return Err(BinlogError::UnknownEvent(event.id));
        }
        self.append(event)
    }

    /// Replace the contents of a live event.
    pub fn rewrite_event(&mut self, id: u64, handler_type: HandlerType, data: impl Into<Bytes>) -> Result<()> {
        self.add_raw_event(BinlogEvent::rewrite(id, handler_type, data))
    }

    pub fn erase_event(&mut self, id: u64) -> Result<()> {
        self.add_raw_event(BinlogEvent::erase(id))
    }

    fn append(&mut self, event: BinlogEvent) -> Result<()> {
        let frame = seal_frame(self.cipher.as_ref(), &event)?;
        let size = frame.len() as u64;
        self.buffer.extend_from_slice(&frame);
        self.need_sync = true;
        self.apply(event, size);

        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        if self.need_reindex() {
            tracing::info!(size = self.size(), live_size = self.live_size, "binlog outgrew its live events");
            self.reindex()?;
        }
        Ok(())
    }

    fn need_reindex(&self) -> bool {
        let size = self.size();
        REINDEX_THRESHOLDS
            .iter()
            .any(|&(min_size, ratio)| size > min_size && size / ratio > self.live_size)
    }

    /// Rewrite the file from the live state under the current header.
    fn reindex(&mut self) -> Result<()> {
        let header = self.header.clone();
        let cipher = self.cipher.clone();
        self.rewrite(header, cipher)
    }

    /// Write the live state under `header` into `<path>.new` and rename it
    /// over the file. On failure the current file stays open as it was.
    fn rewrite(&mut self, header: Header, cipher: Option<BinlogCipher>) -> Result<()> {
        self.ensure_open()?;
        let old_size = self.size();

        let mut contents = Vec::with_capacity(HEADER_LEN + self.live_size as usize);
        contents.extend_from_slice(&header.encode());
        let mut sizes = Vec::with_capacity(self.events.len());
        for live in self.events.values() {
            let frame = seal_frame(cipher.as_ref(), &live.event)?;
            sizes.push(frame.len() as u64);
            contents.extend_from_slice(&frame);
        }

        let new_path = reindex_path(&self.path);
        let replaced = write_synced(&new_path, &contents).and_then(|file| {
            fs::rename(&new_path, &self.path)?;
            Ok(file)
        });
        let file = match replaced {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "binlog rewrite failed, keeping the current file");
                if let Err(cleanup) = remove_if_exists(&new_path) {
                    tracing::warn!(path = %new_path.display(), error = %cleanup, "failed to remove partial rewrite");
                }
                return Err(err);
            }
        };

        self.file = Some(file);
        self.header = header;
        self.cipher = cipher;
        for (live, size) in self.events.values_mut().zip(&sizes) {
            live.size = *size;
        }
        self.live_size = sizes.iter().sum();
        self.buffer.clear();
        self.file_size = contents.len() as u64;
        self.need_sync = false;

        tracing::info!(
            path = %self.path.display(),
            old_size,
            new_size = self.file_size,
            events = self.events.len(),
            encrypted = self.cipher.is_some(),
            "binlog reindexed"
        );
        Ok(())
    }

    /// Write buffered events to the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(BinlogError::Closed)?;
        file.write_all(&self.buffer)?;
        self.file_size += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Flush and wait for the data to reach the disk.
    pub fn force_sync(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        if self.need_sync {
            if let Some(file) = self.file.as_mut() {
                file.sync_data()?;
            }
            self.need_sync = false;
        }
        Ok(())
    }

    /// Re-encrypt the whole file under `new_key`. An empty key decrypts it.
    /// On failure the old key stays in effect.
    pub fn change_key(&mut self, new_key: DbKey) -> Result<()> {
        self.ensure_open()?;
        let (header, cipher) = header_for(&new_key, self.password_kdf)?;
        self.rewrite(header, cipher)?;
        self.key = new_key;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Closing
    // ─────────────────────────────────────────────────────────────────────────

    /// Sync and close. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let synced = self.force_sync();
        self.file = None;
        self.info.is_opened = false;
        tracing::debug!(path = %self.path.display(), "binlog closed");
        synced
    }

    /// Close without syncing and delete the files.
    pub fn close_and_destroy(&mut self) -> Result<()> {
        self.buffer.clear();
        self.file = None;
        self.info.is_opened = false;
        Self::destroy(&self.path)
    }

    /// Delete a binlog and its reindex leftover. Missing files are fine.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        remove_if_exists(&reindex_path(path))?;
        remove_if_exists(path)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    pub fn info(&self) -> BinlogInfo {
        BinlogInfo {
            last_event_id: self.last_event_id,
            encrypted: self.cipher.is_some(),
            live_events: self.events.len(),
            is_opened: self.file.is_some(),
            ..self.info.clone()
        }
    }

    /// Bytes on disk plus bytes waiting to be written.
    pub fn size(&self) -> u64 {
        self.file_size + self.buffer.len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Live events in id order.
    pub fn events(&self) -> impl Iterator<Item = &BinlogEvent> {
        self.events.values().map(|live| &live.event)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(BinlogError::Closed);
        }
        Ok(())
    }
}

impl Drop for Binlog {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.flush() {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to flush binlog on drop");
            }
        }
    }
}

/// A fresh header and cipher for a new file under `key`.
fn header_for(key: &DbKey, password_kdf: KdfParams) -> Result<(Header, Option<BinlogCipher>)> {
    let salt = generate_salt();
    let kdf = KdfParams::for_key(key, password_kdf);
    Ok(match BinlogCipher::derive(key, &salt, kdf)? {
        Some(cipher) => (
            Header {
                encrypted: true,
                salt,
                key_hash: cipher.key_hash(),
                kdf,
            },
            Some(cipher),
        ),
        None => (Header::plaintext(), None),
    })
}

/// Create `path` with `contents` on disk, positioned at its end.
fn write_synced(path: &Path, contents: &[u8]) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(file)
}

fn seal_frame(cipher: Option<&BinlogCipher>, event: &BinlogEvent) -> Result<Vec<u8>> {
    let payload = event.encode();
    let payload = match cipher {
        Some(cipher) => cipher.seal(&payload)?,
        None => payload,
    };
    Ok(format::encode_frame(&payload))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
