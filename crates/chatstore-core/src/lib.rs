//! # Chatstore Core
//!
//! Shared vocabulary of the chatstore persistence layer: identifiers, the
//! records each store persists, query arguments with their validation, and
//! result pages.
//!
//! ## Key Types
//!
//! - [`DialogId`], [`MessageId`], [`StoryId`] - Strong identifier newtypes
//! - [`MessageRecord`] - A message with its optional indexed columns
//! - [`MessageSearchFilter`] - Category filters backed by index buckets
//! - [`MessagesQuery`] - Windowed history pagination
//! - [`DbKey`] - Encryption key for the SQL file and the binlog
//! - [`MessageDateDecoder`] - Reads dates out of opaque message payloads
//!
//! ## Usage
//!
//! ```rust
//! use chatstore_core::{DialogId, MessageId, MessageRecord, MessageSearchFilter, MessagesQuery};
//!
//! let record = MessageRecord::new(DialogId::new(5), MessageId::new(100), &b"payload"[..])
//!     .with_filter(MessageSearchFilter::Photo)
//!     .with_search_text(1, "hello world");
//! assert_eq!(record.index_mask, 1 << 3);
//!
//! let query = MessagesQuery::new(DialogId::new(5), MessageId::MAX, -1, 20);
//! assert!(query.validate().is_ok());
//! ```

pub mod date;
pub mod error;
pub mod filter;
pub mod key;
pub mod query;
pub mod records;
pub mod types;

pub use date::{encode_dated_payload, MessageDateDecoder, PrefixedDateDecoder};
pub use error::{CoreError, Result};
pub use filter::{index_mask_of, MessageSearchFilter, MESSAGE_DB_INDEX_COUNT, MESSAGE_DB_INDEX_COUNT_OLD};
pub use key::{DbKey, RAW_KEY_LEN};
pub use query::{
    ActiveStoryListPage, CalendarQuery, CallsQuery, CallsResult, DialogsPage, DownloadsFtsQuery,
    DownloadsFtsResult, MessageCalendar, MessageFtsQuery, MessageFtsResult, MessagePosition,
    MessagePositions, MessageThreadsPage, MessagesQuery, SparsePositionsQuery, MAX_QUERY_LIMIT,
};
pub use records::{
    ActiveStoriesRecord, DialogMessage, DialogStory, DownloadRecord, DownloadShort, FullMessage,
    FullStory, MessageRecord, MessageThreadRecord, NotificationGroupKey, NotificationGroupUpdate,
    ScheduledMessageKey, ScheduledMessageRecord, StoryFullId, StoryRecord,
};
pub use types::{
    DialogId, FolderId, MessageId, NotificationGroupId, NotificationId, StoryId, StoryListId,
};
