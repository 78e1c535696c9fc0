//! Database encryption keys.

use rand::RngCore;
use std::fmt;

/// Length of a generated raw key.
pub const RAW_KEY_LEN: usize = 32;

/// A key for the SQL file or the binlog.
///
/// `Empty` means "no encryption". A password is stretched with a memory-hard
/// KDF before use (Argon2id in the binlog, PBKDF2 inside SQLCipher). A raw
/// key is already uniform and skips the stretching.
#[derive(Clone, PartialEq, Eq)]
pub enum DbKey {
    Empty,
    Password(String),
    RawKey([u8; RAW_KEY_LEN]),
}

impl DbKey {
    /// Generate a fresh random raw key.
    pub fn generate_raw() -> Self {
        let mut bytes = [0u8; RAW_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::RawKey(bytes)
    }

    /// Build a raw key from stored bytes, `None` if the length is wrong.
    pub fn raw_from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; RAW_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::RawKey(arr))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Password(password) => password.is_empty(),
            Self::RawKey(_) => false,
        }
    }

    pub fn is_raw_key(&self) -> bool {
        matches!(self, Self::RawKey(_))
    }

    /// Key material, used for binlog key derivation.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Password(password) => password.as_bytes(),
            Self::RawKey(bytes) => bytes,
        }
    }

    /// Render the key as a SQLCipher `PRAGMA key` argument.
    pub fn to_sqlcipher_literal(&self) -> String {
        match self {
            Self::Empty => "''".to_string(),
            Self::Password(password) => format!("'{}'", password.replace('\'', "''")),
            Self::RawKey(bytes) => format!("\"x'{}'\"", hex::encode(bytes)),
        }
    }
}

impl Default for DbKey {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "DbKey::Empty"),
            Self::Password(_) => write!(f, "DbKey::Password(..)"),
            Self::RawKey(_) => write!(f, "DbKey::RawKey(..)"),
        }
    }
}
