//! Extracting message dates from opaque payloads.
//!
//! The message table has no date column. Date-based lookups decode the date
//! from the stored payload through a [`MessageDateDecoder`] supplied by the
//! owner of the payload format.

use crate::error::{CoreError, Result};
use crate::types::MessageId;

/// Decodes the send date out of a stored message payload.
pub trait MessageDateDecoder: Send + Sync {
    /// Unix time the message was sent.
    fn message_date(&self, message_id: MessageId, data: &[u8]) -> Result<i32>;
}

/// Payloads that start with the date as a little-endian `i32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixedDateDecoder;

impl MessageDateDecoder for PrefixedDateDecoder {
    fn message_date(&self, message_id: MessageId, data: &[u8]) -> Result<i32> {
        let prefix: [u8; 4] = data
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                CoreError::Decode(format!(
                    "payload of message {} is {} bytes, too short for a date",
                    message_id,
                    data.len()
                ))
            })?;
        Ok(i32::from_le_bytes(prefix))
    }
}

/// Build a payload readable by [`PrefixedDateDecoder`].
pub fn encode_dated_payload(date: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&date.to_le_bytes());
    out.extend_from_slice(body);
    out
}
