//! Event encryption.
//!
//! The file key is derived from the caller's [`DbKey`] and a per-file salt.
//! Passwords are stretched with Argon2id under the [`KdfParams`] stored in
//! the header. Raw keys are already uniform and go through a single BLAKE3
//! derivation. Every event is sealed separately with ChaCha20-Poly1305 under
//! a fresh random nonce. The header stores a keyed hash of the derived key so
//! a wrong key is detected before any event is read.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use chatstore_core::DbKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{BinlogError, Result};

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const KEY_HASH_LEN: usize = 32;

const RAW_KEY_CONTEXT: &str = "chatstore-binlog-v2 raw key";
const KEY_CHECK: &[u8] = b"chatstore-binlog-v2 key check";

/// Work factor of the password key derivation.
///
/// Zero memory marks the raw key path, which has no work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Argon2id memory cost in KiB.
    pub memory_kib: u32,
    /// Argon2id passes over memory.
    pub iterations: u32,
}

impl KdfParams {
    /// Raw keys: one BLAKE3 derivation.
    pub const RAW_KEY: Self = Self {
        memory_kib: 0,
        iterations: 0,
    };

    /// Default password cost: Argon2id with 19 MiB and two passes.
    pub const PASSWORD: Self = Self {
        memory_kib: 19 * 1024,
        iterations: 2,
    };

    /// Largest memory cost a header may ask for.
    pub const MAX_MEMORY_KIB: u32 = 1 << 21;

    pub const fn new(memory_kib: u32, iterations: u32) -> Self {
        Self {
            memory_kib,
            iterations,
        }
    }

    /// Parameters for a new file under `key`, with `password` as the cost
    /// for password keys.
    pub fn for_key(key: &DbKey, password: KdfParams) -> Self {
        if key.is_raw_key() {
            Self::RAW_KEY
        } else {
            password
        }
    }

    pub fn is_raw_key(&self) -> bool {
        self.memory_kib == 0
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::PASSWORD
    }
}

/// A fresh random salt for a new file.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Symmetric key of one binlog file.
#[derive(Clone)]
pub struct BinlogCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for BinlogCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BinlogCipher(..)")
    }
}

impl BinlogCipher {
    /// Derive the file key, or `None` for an empty key.
    ///
    /// A key of the other kind than `params` describe cannot be the key the
    /// file was written with and fails with [`BinlogError::WrongPassword`].
    pub fn derive(key: &DbKey, salt: &[u8; SALT_LEN], params: KdfParams) -> Result<Option<Self>> {
        if key.is_empty() {
            return Ok(None);
        }
        if key.is_raw_key() != params.is_raw_key() {
            return Err(BinlogError::WrongPassword);
        }

        let mut out = [0u8; 32];
        if params.is_raw_key() {
            let mut hasher = blake3::Hasher::new_derive_key(RAW_KEY_CONTEXT);
            hasher.update(salt);
            hasher.update(key.as_bytes());
            out = *hasher.finalize().as_bytes();
        } else {
            if params.memory_kib > KdfParams::MAX_MEMORY_KIB {
                return Err(BinlogError::Encryption(format!(
                    "memory cost of {} KiB is above the limit",
                    params.memory_kib
                )));
            }
            let argon_params = argon2::Params::new(params.memory_kib, params.iterations, 1, Some(out.len()))
                .map_err(|e| BinlogError::Encryption(format!("invalid key derivation parameters: {}", e)))?;
            argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon_params)
                .hash_password_into(key.as_bytes(), salt, &mut out)
                .map_err(|e| BinlogError::Encryption(format!("key derivation failed: {}", e)))?;
        }
        Ok(Some(Self { key: out }))
    }

    /// Value stored in the header to recognise this key.
    pub fn key_hash(&self) -> [u8; KEY_HASH_LEN] {
        *blake3::keyed_hash(&self.key, KEY_CHECK).as_bytes()
    }

    /// Encrypt one payload. Output is `nonce | ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|e| BinlogError::Encryption(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| BinlogError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(BinlogError::Encryption(format!(
                "sealed event of {} bytes is shorter than its nonce",
                sealed.len()
            )));
        }
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|e| BinlogError::Encryption(e.to_string()))?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| BinlogError::Encryption(e.to_string()))
    }
}
