//! Query arguments and result pages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::filter::MessageSearchFilter;
use crate::records::{ActiveStoriesRecord, DialogMessage, DownloadShort, FullMessage};
use crate::types::{DialogId, MessageId};

/// Largest page a single query may request.
pub const MAX_QUERY_LIMIT: i32 = 1_000_000;

fn check_limit(limit: i32) -> Result<()> {
    if limit <= 0 || limit > MAX_QUERY_LIMIT {
        return Err(CoreError::InvalidArgument(format!(
            "limit must be in 1..={}, got {}",
            MAX_QUERY_LIMIT, limit
        )));
    }
    Ok(())
}

fn check_dialog(dialog_id: DialogId) -> Result<()> {
    if !dialog_id.is_valid() {
        return Err(CoreError::InvalidArgument(format!(
            "invalid dialog id {}",
            dialog_id
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Message queries
// ─────────────────────────────────────────────────────────────────────────────

/// A window of a dialog's history around `from_message_id`.
///
/// With `offset == 0` the page holds up to `limit` messages older than
/// `from_message_id`. A negative offset shifts the window so that `-offset`
/// messages at or after `from_message_id` are included first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesQuery {
    pub dialog_id: DialogId,
    pub filter: MessageSearchFilter,
    pub from_message_id: MessageId,
    pub offset: i32,
    pub limit: i32,
}

impl MessagesQuery {
    pub fn new(dialog_id: DialogId, from_message_id: MessageId, offset: i32, limit: i32) -> Self {
        Self {
            dialog_id,
            filter: MessageSearchFilter::Empty,
            from_message_id,
            offset,
            limit,
        }
    }

    pub fn with_filter(mut self, filter: MessageSearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_dialog(self.dialog_id)?;
        check_limit(self.limit)?;
        if !self.from_message_id.is_valid() {
            return Err(CoreError::InvalidArgument(format!(
                "invalid from_message_id {}",
                self.from_message_id
            )));
        }
        if self.offset > 0 || self.offset <= -self.limit {
            return Err(CoreError::InvalidArgument(format!(
                "offset must be in {}..=0, got {}",
                -self.limit + 1,
                self.offset
            )));
        }
        Ok(())
    }
}

/// Day-by-day message counts for one filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarQuery {
    pub dialog_id: DialogId,
    pub filter: MessageSearchFilter,
    pub from_message_id: MessageId,
    /// Offset from UTC in seconds used to cut days.
    pub tz_offset: i32,
}

impl CalendarQuery {
    pub fn validate(&self) -> Result<()> {
        check_dialog(self.dialog_id)?;
        if self.filter.index().is_none() {
            return Err(CoreError::InvalidArgument(
                "calendar requires a non-empty filter".into(),
            ));
        }
        Ok(())
    }
}

/// Evenly spaced sample of a filter's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparsePositionsQuery {
    pub dialog_id: DialogId,
    pub filter: MessageSearchFilter,
    pub from_message_id: MessageId,
    pub limit: i32,
}

impl SparsePositionsQuery {
    pub fn validate(&self) -> Result<()> {
        check_dialog(self.dialog_id)?;
        check_limit(self.limit)?;
        if self.filter.index().is_none() {
            return Err(CoreError::InvalidArgument(
                "sparse positions require a non-empty filter".into(),
            ));
        }
        Ok(())
    }
}

/// Full-text search over messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFtsQuery {
    pub query: String,
    /// Restricts results to one dialog when valid.
    pub dialog_id: DialogId,
    pub filter: MessageSearchFilter,
    /// Exclusive upper bound on `search_id`; 0 starts from the newest.
    pub from_search_id: i64,
    pub limit: i32,
}

impl MessageFtsQuery {
    pub fn new(query: impl Into<String>, limit: i32) -> Self {
        Self {
            query: query.into(),
            dialog_id: DialogId::default(),
            filter: MessageSearchFilter::Empty,
            from_search_id: 0,
            limit,
        }
    }

    pub fn in_dialog(mut self, dialog_id: DialogId) -> Self {
        self.dialog_id = dialog_id;
        self
    }

    pub fn with_filter(mut self, filter: MessageSearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn from_search_id(mut self, from_search_id: i64) -> Self {
        self.from_search_id = from_search_id;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_limit(self.limit)?;
        if self.from_search_id < 0 {
            return Err(CoreError::InvalidArgument(format!(
                "negative from_search_id {}",
                self.from_search_id
            )));
        }
        Ok(())
    }
}

/// Call history across all dialogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallsQuery {
    pub filter: MessageSearchFilter,
    /// Exclusive upper bound on the unique message id.
    pub from_unique_message_id: i32,
    pub limit: i32,
}

impl CallsQuery {
    pub fn validate(&self) -> Result<()> {
        check_limit(self.limit)?;
        if !self.filter.is_call() {
            return Err(CoreError::InvalidArgument(format!(
                "calls query requires Call or MissedCall, got {}",
                self.filter
            )));
        }
        Ok(())
    }
}

/// Full-text search over downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadsFtsQuery {
    pub query: String,
    /// Exclusive upper bound on `download_id`; 0 starts from the newest.
    pub offset: i64,
    pub limit: i32,
}

impl DownloadsFtsQuery {
    pub fn validate(&self) -> Result<()> {
        check_limit(self.limit)?;
        if self.offset < 0 {
            return Err(CoreError::InvalidArgument(format!(
                "negative download offset {}",
                self.offset
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result pages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogsPage {
    pub dialogs: Vec<Bytes>,
    pub next_order: i64,
    pub next_dialog_id: DialogId,
}

/// First message of every day, newest first, and the message count of that day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCalendar {
    pub messages: Vec<DialogMessage>,
    pub total_counts: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePosition {
    /// Zero-based position among the filter's messages, newest first.
    pub position: i32,
    pub date: i32,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePositions {
    pub total_count: i32,
    pub positions: Vec<MessagePosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFtsResult {
    pub messages: Vec<FullMessage>,
    /// Feed back as `from_search_id` to continue.
    pub next_search_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallsResult {
    pub messages: Vec<FullMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStoryListPage {
    pub active_stories: Vec<ActiveStoriesRecord>,
    pub next_order: i64,
    pub next_dialog_id: DialogId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageThreadsPage {
    pub message_threads: Vec<Bytes>,
    pub next_order: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadsFtsResult {
    pub downloads: Vec<DownloadShort>,
    pub next_download_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_messages_query_offsets() {
        let dialog = DialogId::new(5);
        let from = MessageId::new(100);
        assert!(MessagesQuery::new(dialog, from, 0, 10).validate().is_ok());
        assert!(MessagesQuery::new(dialog, from, -9, 10).validate().is_ok());
        assert!(MessagesQuery::new(dialog, from, -10, 10).validate().is_err());
        assert!(MessagesQuery::new(dialog, from, 1, 10).validate().is_err());
        assert!(MessagesQuery::new(dialog, from, 0, 0).validate().is_err());
        assert!(MessagesQuery::new(DialogId::default(), from, 0, 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_calls_query_requires_call_filter() {
        let mut query = CallsQuery {
            filter: MessageSearchFilter::Photo,
            from_unique_message_id: i32::MAX,
            limit: 10,
        };
        assert!(query.validate().is_err());
        query.filter = MessageSearchFilter::MissedCall;
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_sparse_requires_filter() {
        let query = SparsePositionsQuery {
            dialog_id: DialogId::new(1),
            filter: MessageSearchFilter::Empty,
            from_message_id: MessageId::MAX,
            limit: 5,
        };
        assert!(query.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_offset_window(limit in 1i32..500, offset in -600i32..100) {
            let query = MessagesQuery::new(DialogId::new(1), MessageId::new(10), offset, limit);
            let expected = offset <= 0 && offset > -limit;
            prop_assert_eq!(query.validate().is_ok(), expected);
        }
    }
}
