//! Transparent value encryption for a storage adapter

use std::sync::Arc;

use async_trait::async_trait;

use super::{StorageAdapter, StorageKey};
use crate::crypto::DocumentCipher;
use crate::error::SyncError;
use crate::identity::SymmetricKey;

/// Encrypts values on `put` and decrypts them on `get`.
///
/// Keys, listing and deletion pass through untouched. The encoded key is
/// bound into each record as associated data. A value that cannot be opened
/// yields `SyncError::DecryptionFailed`, never `Ok(None)`.
pub struct EncryptedStorage {
    inner: Arc<dyn StorageAdapter>,
    cipher: DocumentCipher,
}

impl EncryptedStorage {
    /// Wrap `inner`, sealing values under `key`
    pub fn new(inner: Arc<dyn StorageAdapter>, key: &SymmetricKey) -> Self {
        Self {
            inner,
            cipher: DocumentCipher::new(key),
        }
    }

    /// Fingerprint of the sealing key
    pub fn key_id(&self) -> [u8; 8] {
        self.cipher.key_id()
    }
}

#[async_trait]
impl StorageAdapter for EncryptedStorage {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, SyncError> {
        match self.inner.get(key).await? {
            Some(bytes) => {
                let aad = key.encode();
                let plaintext = self.cipher.open_bytes(&bytes, aad.as_bytes()).map_err(|e| {
                    SyncError::DecryptionFailed(format!("record {key}: {e}"))
                })?;
                Ok(Some(plaintext))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), SyncError> {
        let aad = key.encode();
        let record = self.cipher.seal(value, aad.as_bytes())?;
        self.inner.put(key, &record.to_bytes()?).await
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), SyncError> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>, SyncError> {
        self.inner.list_keys(prefix).await
    }
}
