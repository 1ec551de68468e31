//! Volatile in-memory storage adapter

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{StorageAdapter, StorageKey};
use crate::error::SyncError;

/// `BTreeMap`-backed adapter.
///
/// Used for tests and volatile tiers. Failure injection via
/// [`MemoryStorage::set_failing`] makes every operation return
/// `SyncError::Storage`, simulating an unreachable backend.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<StorageKey, Vec<u8>>>,
    failing: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all raw entries, bypassing failure injection
    pub fn dump(&self) -> Vec<(StorageKey, Vec<u8>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Overwrite a raw entry, bypassing failure injection
    pub fn insert_raw(&self, key: StorageKey, value: Vec<u8>) {
        self.entries.write().insert(key, value);
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("memory storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, SyncError> {
        self.check()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), SyncError> {
        self.check()?;
        self.entries.write().insert(key.clone(), value.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), SyncError> {
        self.check()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>, SyncError> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
