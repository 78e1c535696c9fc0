//! Binlog events.

use std::fmt;

use bytes::Bytes;

use crate::error::{BinlogError, Result};

/// Tag naming the component that owns an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerType(pub u32);

impl HandlerType {
    /// Marks an erased event. Never handed to a replay handler.
    pub const EMPTY: Self = Self(0);
    /// Entries of the binlog key-value store.
    pub const BINLOG_PMC_MAGIC: Self = Self(0x4327);
    /// Entries of the config key-value store.
    pub const CONFIG_PMC_MAGIC: Self = Self(0x1f18);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerType({:#x})", self.0)
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Event flag bits.
pub mod flags {
    /// The event replaces the live event with the same id.
    pub const REWRITE: u32 = 1;
}

/// Fixed part of an encoded event: id, handler type and flags.
pub const EVENT_HEADER_LEN: usize = 16;

/// One record of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEvent {
    pub id: u64,
    pub handler_type: HandlerType,
    pub flags: u32,
    pub data: Bytes,
}

impl BinlogEvent {
    pub fn new(id: u64, handler_type: HandlerType, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            handler_type,
            flags: 0,
            data: data.into(),
        }
    }

    /// An event replacing the live event `id`.
    pub fn rewrite(id: u64, handler_type: HandlerType, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            handler_type,
            flags: flags::REWRITE,
            data: data.into(),
        }
    }

    /// An event erasing the live event `id`.
    pub fn erase(id: u64) -> Self {
        Self::rewrite(id, HandlerType::EMPTY, Bytes::new())
    }

    pub fn is_rewrite(&self) -> bool {
        self.flags & flags::REWRITE != 0
    }

    pub fn is_erase(&self) -> bool {
        self.is_rewrite() && self.handler_type == HandlerType::EMPTY
    }

    /// `id | handler_type | flags | data`, little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.handler_type.0.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < EVENT_HEADER_LEN {
            return Err(BinlogError::Corrupted(format!(
                "event of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let (id, rest) = payload.split_at(8);
        let (handler_type, rest) = rest.split_at(4);
        let (flags, data) = rest.split_at(4);
        Ok(Self {
            id: u64::from_le_bytes(id.try_into().map_err(|_| corrupted_header())?),
            handler_type: HandlerType(u32::from_le_bytes(handler_type.try_into().map_err(|_| corrupted_header())?)),
            flags: u32::from_le_bytes(flags.try_into().map_err(|_| corrupted_header())?),
            data: Bytes::copy_from_slice(data),
        })
    }
}

fn corrupted_header() -> BinlogError {
    BinlogError::Corrupted("malformed event header".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encoding() {
        let event = BinlogEvent::rewrite(0x0102, HandlerType::new(7), &b"abc"[..]);
        let bytes = event.encode();
        assert_eq!(bytes.len(), EVENT_HEADER_LEN + 3);
        assert_eq!(&bytes[..8], &0x0102u64.to_le_bytes());
        assert_eq!(BinlogEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_short_event_is_corrupted() {
        assert!(matches!(BinlogEvent::decode(&[0u8; 15]), Err(BinlogError::Corrupted(_))));
    }

    #[test]
    fn test_erase_event() {
        let erase = BinlogEvent::erase(5);
        assert!(erase.is_rewrite());
        assert!(erase.is_erase());
        assert!(!BinlogEvent::new(5, HandlerType::EMPTY, Bytes::new()).is_erase());
    }
}
