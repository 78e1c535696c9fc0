//! On-disk layout.
//!
//! ```text
//! header: magic "CSBL" | version u32 | encrypted u8 | 3 reserved | salt[32] | key_hash[32]
//!         | kdf_memory_kib u32 | kdf_iterations u32 | checksum u32
//! frame:  len u32 | payload[len] | checksum u32
//! ```
//!
//! All integers are little-endian. A checksum is the first four bytes of the
//! BLAKE3 hash of everything before it in the same header or frame.

use crate::crypto::{KdfParams, KEY_HASH_LEN, SALT_LEN};
use crate::error::{BinlogError, Result};

pub const MAGIC: [u8; 4] = *b"CSBL";
pub const FORMAT_VERSION: u32 = 2;
pub const HEADER_LEN: usize = 88;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = 8;

/// Payloads longer than this are treated as garbage.
pub const MAX_PAYLOAD_LEN: usize = 1 << 26;

fn checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub encrypted: bool,
    pub salt: [u8; SALT_LEN],
    pub key_hash: [u8; KEY_HASH_LEN],
    pub kdf: KdfParams,
}

impl Header {
    pub fn plaintext() -> Self {
        Self {
            encrypted: false,
            salt: [0u8; SALT_LEN],
            key_hash: [0u8; KEY_HASH_LEN],
            kdf: KdfParams::RAW_KEY,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[8] = u8::from(self.encrypted);
        out[12..44].copy_from_slice(&self.salt);
        out[44..76].copy_from_slice(&self.key_hash);
        out[76..80].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        out[80..84].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        let sum = checksum(&[&out[..84]]);
        out[84..88].copy_from_slice(&sum.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BinlogError::Corrupted(format!("header truncated to {} bytes", buf.len())));
        }
        if buf[0..4] != MAGIC {
            return Err(BinlogError::Corrupted("bad magic".into()));
        }
        if read_u32(buf, 84) != checksum(&[&buf[..84]]) {
            return Err(BinlogError::Corrupted("header checksum mismatch".into()));
        }
        let version = read_u32(buf, 4);
        if version != FORMAT_VERSION {
            return Err(BinlogError::Corrupted(format!("unsupported format version {}", version)));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[12..44]);
        let mut key_hash = [0u8; KEY_HASH_LEN];
        key_hash.copy_from_slice(&buf[44..76]);
        let kdf = KdfParams::new(read_u32(buf, 76), read_u32(buf, 80));
        if kdf.memory_kib > KdfParams::MAX_MEMORY_KIB {
            return Err(BinlogError::Corrupted(format!("key derivation memory of {} KiB", kdf.memory_kib)));
        }
        Ok(Self {
            encrypted: buf[8] != 0,
            salt,
            key_hash,
            kdf,
        })
    }
}

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_le_bytes();
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(&[&len, payload]).to_le_bytes());
    out
}

/// Result of reading one frame from the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead<'a> {
    /// A complete, intact frame and its total size.
    Frame { payload: &'a [u8], size: usize },
    /// The buffer ends cleanly.
    End,
    /// The rest of the buffer is a partial or damaged frame.
    Damaged(&'static str),
}

pub fn read_frame(buf: &[u8]) -> FrameRead<'_> {
    if buf.is_empty() {
        return FrameRead::End;
    }
    if buf.len() < 4 {
        return FrameRead::Damaged("partial length");
    }
    let len = read_u32(buf, 0) as usize;
    if len > MAX_PAYLOAD_LEN {
        return FrameRead::Damaged("implausible length");
    }
    let size = len + FRAME_OVERHEAD;
    if buf.len() < size {
        return FrameRead::Damaged("partial frame");
    }
    let payload = &buf[4..4 + len];
    if read_u32(buf, 4 + len) != checksum(&[&buf[..4], payload]) {
        return FrameRead::Damaged("checksum mismatch");
    }
    FrameRead::Frame { payload, size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header {
            encrypted: true,
            salt: [3u8; SALT_LEN],
            key_hash: [4u8; KEY_HASH_LEN],
            kdf: KdfParams::PASSWORD,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..4], b"CSBL");
        assert_eq!(&bytes[76..80], &(19u32 * 1024).to_le_bytes());
        assert_eq!(&bytes[80..84], &2u32.to_le_bytes());
        assert_eq!(Header::decode(&bytes).unwrap(), header);

        let mut damaged = bytes;
        damaged[20] ^= 1;
        assert!(matches!(Header::decode(&damaged), Err(BinlogError::Corrupted(_))));
    }

    #[test]
    fn test_header_rejects_oversized_work_factor() {
        let header = Header {
            encrypted: true,
            salt: [1u8; SALT_LEN],
            key_hash: [2u8; KEY_HASH_LEN],
            kdf: KdfParams::new(KdfParams::MAX_MEMORY_KIB + 1, 1),
        };
        assert!(matches!(Header::decode(&header.encode()), Err(BinlogError::Corrupted(_))));

        let mut old = Header::plaintext().encode();
        old[4..8].copy_from_slice(&1u32.to_le_bytes());
        let sum = checksum(&[&old[..84]]);
        old[84..88].copy_from_slice(&sum.to_le_bytes());
        assert!(matches!(Header::decode(&old), Err(BinlogError::Corrupted(_))));
    }

    #[test]
    fn test_frames_in_sequence() {
        let mut buf = encode_frame(b"first");
        buf.extend(encode_frame(b""));

        let FrameRead::Frame { payload, size } = read_frame(&buf) else {
            panic!("expected a frame");
        };
        assert_eq!((payload, size), (&b"first"[..], 13));
        assert_eq!(read_frame(&buf[size..]), FrameRead::Frame { payload: b"", size: 8 });
        assert_eq!(read_frame(&buf[size + 8..]), FrameRead::End);
    }

    #[test]
    fn test_damaged_frames() {
        let frame = encode_frame(b"payload");
        assert_eq!(read_frame(&frame[..2]), FrameRead::Damaged("partial length"));
        assert_eq!(read_frame(&frame[..frame.len() - 1]), FrameRead::Damaged("partial frame"));

        let mut flipped = frame.clone();
        flipped[6] ^= 0xff;
        assert_eq!(read_frame(&flipped), FrameRead::Damaged("checksum mismatch"));
    }
}
