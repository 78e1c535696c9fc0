//! Message search filters and their secondary index buckets.
//!
//! Every filter except `Empty` owns one bit of a message's `index_mask`.
//! The bit position is the filter's discriminant minus one, and the store
//! keeps one partial index per bit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of secondary index buckets in the current schema.
pub const MESSAGE_DB_INDEX_COUNT: usize = 30;

/// Number of buckets created by the first media index migration.
pub const MESSAGE_DB_INDEX_COUNT_OLD: usize = 9;

/// A category filter for message queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageSearchFilter {
    #[default]
    Empty = 0,
    Animation,
    Audio,
    Document,
    Photo,
    Video,
    VoiceNote,
    PhotoAndVideo,
    Url,
    ChatPhoto,
    Call,
    MissedCall,
    VideoNote,
    VoiceAndVideoNote,
    Mention,
    UnreadMention,
    FailedToSend,
    Pinned,
    UnreadReaction,
}

impl MessageSearchFilter {
    /// All filters in discriminant order.
    pub const ALL: [Self; 19] = [
        Self::Empty,
        Self::Animation,
        Self::Audio,
        Self::Document,
        Self::Photo,
        Self::Video,
        Self::VoiceNote,
        Self::PhotoAndVideo,
        Self::Url,
        Self::ChatPhoto,
        Self::Call,
        Self::MissedCall,
        Self::VideoNote,
        Self::VoiceAndVideoNote,
        Self::Mention,
        Self::UnreadMention,
        Self::FailedToSend,
        Self::Pinned,
        Self::UnreadReaction,
    ];

    /// Index bucket of this filter, `None` for `Empty`.
    pub const fn index(&self) -> Option<usize> {
        match self {
            Self::Empty => None,
            other => Some(*other as usize - 1),
        }
    }

    /// Bit of this filter inside an index mask, 0 for `Empty`.
    pub const fn mask(&self) -> i32 {
        match self.index() {
            Some(index) => 1 << index,
            None => 0,
        }
    }

    /// Filter owning the given bucket.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index + 1).copied()
    }

    /// Whether this filter selects call history.
    pub const fn is_call(&self) -> bool {
        matches!(self, Self::Call | Self::MissedCall)
    }
}

impl fmt::Display for MessageSearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Build an index mask from a set of filters.
pub fn index_mask_of(filters: &[MessageSearchFilter]) -> i32 {
    filters.iter().fold(0, |mask, filter| mask | filter.mask())
}
