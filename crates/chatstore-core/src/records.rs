//! Records written to and read from the stores.
//!
//! Payloads are opaque [`Bytes`] owned by the caller's domain layer. Optional
//! columns are `Option`s and are stored as SQL `NULL` when absent, which keeps
//! them out of the partial indexes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::filter::MessageSearchFilter;
use crate::types::{DialogId, MessageId, NotificationGroupId, NotificationId, StoryId, StoryListId};

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// A message as written by `add_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub dialog_id: DialogId,
    pub message_id: MessageId,
    /// Server-wide id, used for call history and lookups by unique id.
    pub unique_message_id: Option<i32>,
    pub sender_dialog_id: Option<DialogId>,
    pub random_id: Option<i64>,
    pub ttl_expires_at: Option<i32>,
    /// Bitmask of [`MessageSearchFilter`] buckets the message belongs to.
    pub index_mask: i32,
    /// Full-text row id. The message is searchable only when this is set.
    pub search_id: Option<i64>,
    pub text: String,
    pub notification_id: Option<NotificationId>,
    pub top_thread_message_id: Option<MessageId>,
    pub data: Bytes,
}

impl MessageRecord {
    /// A message with only the mandatory columns set.
    pub fn new(dialog_id: DialogId, message_id: MessageId, data: impl Into<Bytes>) -> Self {
        Self {
            dialog_id,
            message_id,
            unique_message_id: None,
            sender_dialog_id: None,
            random_id: None,
            ttl_expires_at: None,
            index_mask: 0,
            search_id: None,
            text: String::new(),
            notification_id: None,
            top_thread_message_id: None,
            data: data.into(),
        }
    }

    pub fn with_unique_message_id(mut self, unique_message_id: i32) -> Self {
        self.unique_message_id = Some(unique_message_id);
        self
    }

    pub fn with_sender(mut self, sender_dialog_id: DialogId) -> Self {
        self.sender_dialog_id = Some(sender_dialog_id);
        self
    }

    pub fn with_random_id(mut self, random_id: i64) -> Self {
        self.random_id = Some(random_id);
        self
    }

    pub fn with_ttl_expires_at(mut self, ttl_expires_at: i32) -> Self {
        self.ttl_expires_at = Some(ttl_expires_at);
        self
    }

    pub fn with_index_mask(mut self, index_mask: i32) -> Self {
        self.index_mask = index_mask;
        self
    }

    /// Add the message to one filter bucket.
    pub fn with_filter(mut self, filter: MessageSearchFilter) -> Self {
        self.index_mask |= filter.mask();
        self
    }

    /// Make the message searchable under `search_id`.
    pub fn with_search_text(mut self, search_id: i64, text: impl Into<String>) -> Self {
        self.search_id = Some(search_id);
        self.text = text.into();
        self
    }

    pub fn with_notification_id(mut self, notification_id: NotificationId) -> Self {
        self.notification_id = Some(notification_id);
        self
    }

    pub fn with_top_thread_message_id(mut self, top_thread_message_id: MessageId) -> Self {
        self.top_thread_message_id = Some(top_thread_message_id);
        self
    }
}

/// A message read back within a known dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogMessage {
    pub message_id: MessageId,
    pub data: Bytes,
}

/// A message read back together with its dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullMessage {
    pub dialog_id: DialogId,
    pub message_id: MessageId,
    pub data: Bytes,
}

/// A scheduled message. Scheduled messages live in their own table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessageRecord {
    pub dialog_id: DialogId,
    pub message_id: MessageId,
    /// Set once the server has accepted the scheduled message.
    pub server_message_id: Option<i32>,
    pub data: Bytes,
}

/// How a scheduled message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledMessageKey {
    Local(MessageId),
    Server(i32),
}

// ─────────────────────────────────────────────────────────────────────────────
// Dialogs
// ─────────────────────────────────────────────────────────────────────────────

/// A notification group row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationGroupKey {
    pub group_id: NotificationGroupId,
    pub dialog_id: DialogId,
    /// 0 when the group has no notifications.
    pub last_notification_date: i32,
}

impl NotificationGroupKey {
    pub fn new(group_id: NotificationGroupId, dialog_id: DialogId, last_notification_date: i32) -> Self {
        Self {
            group_id,
            dialog_id,
            last_notification_date,
        }
    }

    /// Cursor that starts before every stored group.
    pub fn newest() -> Self {
        Self {
            group_id: NotificationGroupId::new(i32::MAX),
            dialog_id: DialogId::new(i64::MAX),
            last_notification_date: i32::MAX,
        }
    }
}

/// A change to a dialog's notification groups, applied with `add_dialog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationGroupUpdate {
    Upsert(NotificationGroupKey),
    Remove(NotificationGroupId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Stories
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryFullId {
    pub dialog_id: DialogId,
    pub story_id: StoryId,
}

impl StoryFullId {
    pub fn new(dialog_id: DialogId, story_id: StoryId) -> Self {
        Self { dialog_id, story_id }
    }
}

/// A story as written by `add_story`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub story_full_id: StoryFullId,
    pub expires_at: Option<i32>,
    pub notification_id: Option<NotificationId>,
    pub data: Bytes,
}

impl StoryRecord {
    pub fn new(story_full_id: StoryFullId, data: impl Into<Bytes>) -> Self {
        Self {
            story_full_id,
            expires_at: None,
            notification_id: None,
            data: data.into(),
        }
    }

    pub fn with_expires_at(mut self, expires_at: i32) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_notification_id(mut self, notification_id: NotificationId) -> Self {
        self.notification_id = Some(notification_id);
        self
    }
}

/// A story read back within a known dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogStory {
    pub story_id: StoryId,
    pub data: Bytes,
}

/// A story read back together with its dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStory {
    pub story_full_id: StoryFullId,
    pub data: Bytes,
}

/// The active stories of one dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStoriesRecord {
    pub dialog_id: DialogId,
    /// `None` when the dialog is not shown in any story list.
    pub story_list_id: Option<StoryListId>,
    pub dialog_order: i64,
    pub data: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Message threads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageThreadRecord {
    pub dialog_id: DialogId,
    pub top_thread_message_id: MessageId,
    pub thread_order: i64,
    pub data: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Downloads
// ─────────────────────────────────────────────────────────────────────────────

/// A file download entry. The store assigns `download_id` on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub unique_file_id: Bytes,
    pub file_source: Bytes,
    /// Text indexed for full-text search over downloads.
    pub search_text: String,
    pub date: i32,
    pub priority: i32,
}

/// A download as returned by listing and search queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadShort {
    pub download_id: i64,
    pub unique_file_id: Bytes,
    pub file_source: Bytes,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let record = MessageRecord::new(DialogId::new(5), MessageId::new(100), &b"payload"[..])
            .with_filter(MessageSearchFilter::Photo)
            .with_filter(MessageSearchFilter::Pinned)
            .with_search_text(7, "hello world")
            .with_random_id(99);

        assert_eq!(record.index_mask, (1 << 3) | (1 << 16));
        assert_eq!(record.search_id, Some(7));
        assert_eq!(record.random_id, Some(99));
        assert_eq!(record.unique_message_id, None);
    }

    #[test]
    fn test_newest_notification_cursor() {
        let key = NotificationGroupKey::newest();
        assert_eq!(key.last_notification_date, i32::MAX);
        assert_eq!(key.dialog_id, DialogId::new(i64::MAX));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = StoryRecord::new(StoryFullId::new(DialogId::new(1), StoryId::new(2)), &b"x"[..])
            .with_expires_at(10);
        let json = serde_json::to_string(&record).unwrap();
        let back: StoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
