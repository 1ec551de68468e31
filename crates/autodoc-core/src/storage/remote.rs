//! Remote (slow-tier) repositories, one per identity

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MemoryStorage, StorageAdapter};
use crate::identity::Identity;

/// The authoritative remote store, partitioned by owning identity.
///
/// `scoped(owner)` is the slow tier as seen inside `owner`'s repository.
pub trait RemoteStore: Send + Sync {
    /// Storage inside `owner`'s repository
    fn scoped(&self, owner: &Identity) -> Arc<dyn StorageAdapter>;
}

/// In-memory [`RemoteStore`] keeping one [`MemoryStorage`] per identity.
#[derive(Default)]
pub struct MemoryRemote {
    repos: Mutex<HashMap<Identity, Arc<MemoryStorage>>>,
}

impl MemoryRemote {
    /// Create an empty remote
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete repository of `owner`, created on first use
    pub fn repo(&self, owner: &Identity) -> Arc<MemoryStorage> {
        self.repos
            .lock()
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone()
    }

    /// Owners that have a repository
    pub fn owners(&self) -> Vec<Identity> {
        let mut owners: Vec<_> = self.repos.lock().keys().cloned().collect();
        owners.sort();
        owners
    }
}

impl RemoteStore for MemoryRemote {
    fn scoped(&self, owner: &Identity) -> Arc<dyn StorageAdapter> {
        self.repo(owner)
    }
}
