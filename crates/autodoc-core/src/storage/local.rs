//! Fast local tier on a redb file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use super::{StorageAdapter, StorageKey};
use crate::error::SyncError;

// Encoded `StorageKey` -> value
const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// redb-backed [`StorageAdapter`].
///
/// One table maps encoded keys to values. Because the key encoding is
/// prefix-free, a string range scan starting at an encoded prefix yields
/// exactly the keys under that prefix.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStorage {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of stored entries
    pub fn entry_count(&self) -> Result<u64, SyncError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        Ok(table.len()?)
    }
}

#[async_trait]
impl StorageAdapter for RedbStorage {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, SyncError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        let encoded = key.encode();
        Ok(table.get(encoded.as_str())?.map(|v| v.value().to_vec()))
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), SyncError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            let encoded = key.encode();
            table.insert(encoded.as_str(), value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), SyncError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE)?;
            let encoded = key.encode();
            table.remove(encoded.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>, SyncError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_TABLE)?;
        let encoded_prefix = prefix.encode();

        let mut keys = Vec::new();
        for entry in table.range(encoded_prefix.as_str()..)? {
            let (key, _) = entry?;
            let encoded = key.value();
            if !encoded.starts_with(encoded_prefix.as_str()) {
                break;
            }
            keys.push(StorageKey::decode(encoded)?);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = RedbStorage::open(temp_dir.path().join("nested/dir/fast.redb")).unwrap();
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (storage, _temp) = create_test_storage();
        let key = StorageKey::new(["catalog/did:plc:alice", "snapshot", "abc"]);

        assert!(storage.get(&key).await.unwrap().is_none());
        storage.put(&key, b"bytes").await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap().unwrap(), b"bytes");

        storage.put(&key, b"replaced").await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap().unwrap(), b"replaced");

        storage.delete(&key).await.unwrap();
        assert!(storage.get(&key).await.unwrap().is_none());
        assert_eq!(storage.entry_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_keys_respects_segment_boundaries() {
        let (storage, _temp) = create_test_storage();
        storage.put(&StorageKey::new(["doc", "a"]), b"1").await.unwrap();
        storage.put(&StorageKey::new(["doc", "b"]), b"2").await.unwrap();
        storage.put(&StorageKey::new(["doc2", "a"]), b"3").await.unwrap();
        storage.put(&StorageKey::new(["do"]), b"4").await.unwrap();

        let keys = storage.list_keys(&StorageKey::new(["doc"])).await.unwrap();
        assert_eq!(
            keys,
            vec![StorageKey::new(["doc", "a"]), StorageKey::new(["doc", "b"])]
        );
        assert_eq!(storage.list_keys(&StorageKey::root()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fast.redb");
        let key = StorageKey::new(["k"]);
        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.put(&key, b"durable").await.unwrap();
        }
        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.get(&key).await.unwrap().unwrap(), b"durable");
    }
}
