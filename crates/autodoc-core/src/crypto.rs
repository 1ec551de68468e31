//! Encryption of stored document records using ChaCha20-Poly1305 AEAD
//!
//! Values written to an encrypted slow tier are replaced by an
//! [`EncryptedRecord`]: the ciphertext plus everything needed to open it
//! again except the key itself.
//!
//! # Wire Format
//!
//! `postcard(EncryptedRecord { version, key_id[8], nonce[12], ciphertext + tag[16] })`
//!
//! The storage key is bound in as associated data, so a record moved to a
//! different key fails to open.
//!
//! # Example
//!
//! ```
//! use autodoc_core::crypto::DocumentCipher;
//! use autodoc_core::identity::SymmetricKey;
//!
//! let cipher = DocumentCipher::new(&SymmetricKey::from_bytes([7u8; 32]));
//! let record = cipher.seal(b"hello", b"snapshot").unwrap();
//! let bytes = record.to_bytes().unwrap();
//!
//! let opened = cipher.open_bytes(&bytes, b"snapshot").unwrap();
//! assert_eq!(opened, b"hello");
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::identity::SymmetricKey;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

/// Ciphertext plus the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    /// Format version
    pub version: u8,
    /// Fingerprint of the sealing key
    pub key_id: [u8; 8],
    /// Random per-record nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended auth tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedRecord {
    /// Encode for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from storage.
    ///
    /// Undecodable bytes are reported as `DecryptionFailed`: from the
    /// reader's point of view the record is unreadable, not absent.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::DecryptionFailed(format!("malformed record: {e}")))
    }
}

/// Symmetric cipher bound to one document key.
pub struct DocumentCipher {
    cipher: ChaCha20Poly1305,
    key_id: [u8; 8],
}

impl DocumentCipher {
    /// Create a cipher for the given key.
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            key_id: key.key_id(),
        }
    }

    /// Fingerprint of the key this cipher seals with.
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt `plaintext`, binding `aad` into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedRecord, SyncError> {
        let nonce = Self::generate_nonce();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedRecord {
            version: RECORD_VERSION,
            key_id: self.key_id,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt a record sealed with the same key and `aad`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::DecryptionFailed` for an unknown version, a record
    /// sealed under another key, or a failed authentication tag.
    pub fn open(&self, record: &EncryptedRecord, aad: &[u8]) -> Result<Vec<u8>, SyncError> {
        if record.version != RECORD_VERSION {
            return Err(SyncError::DecryptionFailed(format!(
                "unsupported record version {}",
                record.version
            )));
        }
        if record.key_id != self.key_id {
            return Err(SyncError::DecryptionFailed(format!(
                "record sealed under key {} but current key is {}",
                hex::encode(record.key_id),
                hex::encode(self.key_id)
            )));
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(&record.nonce),
                Payload {
                    msg: &record.ciphertext,
                    aad,
                },
            )
            .map_err(|e| SyncError::DecryptionFailed(format!("{}", e)))
    }

    /// Decode and decrypt stored record bytes.
    pub fn open_bytes(&self, bytes: &[u8], aad: &[u8]) -> Result<Vec<u8>, SyncError> {
        self.open(&EncryptedRecord::from_bytes(bytes)?, aad)
    }
}
