//! Strong identifier types.
//!
//! Every identifier stored in a column is a newtype so that a dialog id can
//! never be bound where a message id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            /// Wrap a raw value.
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Get the raw value.
            pub const fn get(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of a chat, channel, user or secret chat.
    DialogId(i64)
);

id_type!(
    /// Identifier of a message inside a dialog. Ids grow in server order.
    MessageId(i64)
);

id_type!(
    /// Identifier of a story inside the posting dialog.
    StoryId(i32)
);

id_type!(
    /// Identifier of a notification.
    NotificationId(i32)
);

id_type!(
    /// Identifier of a notification group.
    NotificationGroupId(i32)
);

id_type!(
    /// Identifier of a chat folder.
    FolderId(i32)
);

/// Secret chats occupy the dialog id range below this bound.
const SECRET_CHAT_ID_BOUND: i64 = -1_500_000_000_000;

impl DialogId {
    /// A dialog id is valid when it is not zero.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Whether this dialog is an end-to-end encrypted secret chat.
    pub const fn is_secret_chat(&self) -> bool {
        self.0 < SECRET_CHAT_ID_BOUND
    }

    /// Exclusive upper bound of the secret chat id range.
    pub const SECRET_CHAT_BOUND: Self = Self(SECRET_CHAT_ID_BOUND);
}

impl MessageId {
    /// Upper bound used as "newest" when paginating.
    pub const MAX: Self = Self(i64::MAX);

    /// A stored message id is strictly positive.
    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl StoryId {
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl NotificationId {
    /// Upper bound used as "newest" when paginating by notification.
    pub const MAX: Self = Self(i32::MAX);

    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl NotificationGroupId {
    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl FolderId {
    /// The main chat list.
    pub const MAIN: Self = Self(0);
    /// The archive.
    pub const ARCHIVE: Self = Self(1);
}

/// The story list a dialog's active stories are shown in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoryListId {
    Main,
    Archive,
}

impl StoryListId {
    /// Column value of this list.
    pub const fn get(&self) -> i32 {
        match self {
            Self::Main => 0,
            Self::Archive => 1,
        }
    }

    /// Parse a stored column value.
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Main),
            1 => Some(Self::Archive),
            _ => None,
        }
    }
}

impl fmt::Display for StoryListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Archive => write!(f, "archive"),
        }
    }
}
