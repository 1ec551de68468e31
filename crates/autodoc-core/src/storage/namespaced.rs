//! Per-document key namespacing

use std::sync::Arc;

use async_trait::async_trait;

use super::{StorageAdapter, StorageKey};
use crate::error::SyncError;
use crate::types::DocumentId;

/// Confines an adapter to the sub-namespace of one document.
///
/// The whole document id becomes a single leading key segment. Segments are
/// length-delimited when encoded, so two distinct ids can never produce
/// overlapping key ranges.
pub struct NamespacedStorage {
    inner: Arc<dyn StorageAdapter>,
    namespace: String,
}

impl NamespacedStorage {
    /// Namespace `inner` by `doc_id`
    pub fn new(inner: Arc<dyn StorageAdapter>, doc_id: &DocumentId) -> Self {
        Self::with_namespace(inner, doc_id.to_string())
    }

    /// Namespace `inner` by an arbitrary segment
    pub fn with_namespace(inner: Arc<dyn StorageAdapter>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    /// The namespace segment
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn scoped(&self, key: &StorageKey) -> StorageKey {
        key.prepend(self.namespace.as_str())
    }
}

#[async_trait]
impl StorageAdapter for NamespacedStorage {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, SyncError> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), SyncError> {
        self.inner.put(&self.scoped(key), value).await
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), SyncError> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn list_keys(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>, SyncError> {
        let namespace = StorageKey::new([self.namespace.as_str()]);
        Ok(self
            .inner
            .list_keys(&self.scoped(prefix))
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&namespace))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_documents_do_not_see_each_other() {
        let backing = Arc::new(MemoryStorage::new());
        let a = NamespacedStorage::with_namespace(backing.clone(), "dm/a/b");
        let b = NamespacedStorage::with_namespace(backing.clone(), "dm/a");
        let key = StorageKey::new(["b", "snapshot"]);

        a.put(&StorageKey::new(["snapshot"]), b"from a").await.unwrap();
        b.put(&key, b"from b").await.unwrap();

        assert_eq!(
            a.list_keys(&StorageKey::root()).await.unwrap(),
            vec![StorageKey::new(["snapshot"])]
        );
        assert_eq!(b.list_keys(&StorageKey::root()).await.unwrap(), vec![key.clone()]);
        assert_eq!(
            a.get(&StorageKey::new(["snapshot"])).await.unwrap().unwrap(),
            b"from a"
        );
        assert_eq!(backing.len(), 2);
    }

    #[tokio::test]
    async fn test_namespace_visible_to_backing_store() {
        let backing = Arc::new(MemoryStorage::new());
        let doc = DocumentId::parse("space/lobby").unwrap();
        let ns = NamespacedStorage::new(backing.clone(), &doc);
        ns.put(&StorageKey::new(["incremental", "h1"]), b"x").await.unwrap();

        let raw = backing.dump();
        assert_eq!(raw[0].0, StorageKey::new(["space/lobby", "incremental", "h1"]));
    }

    #[tokio::test]
    async fn test_delete_and_prefix_listing() {
        let ns = NamespacedStorage::with_namespace(Arc::new(MemoryStorage::new()), "n");
        ns.put(&StorageKey::new(["snapshot", "1"]), b"").await.unwrap();
        ns.put(&StorageKey::new(["incremental", "2"]), b"").await.unwrap();

        let snaps = ns.list_keys(&StorageKey::new(["snapshot"])).await.unwrap();
        assert_eq!(snaps, vec![StorageKey::new(["snapshot", "1"])]);

        ns.delete(&StorageKey::new(["snapshot", "1"])).await.unwrap();
        assert_eq!(ns.list_keys(&StorageKey::root()).await.unwrap().len(), 1);
    }
}
