//! Public key resolution for counterpart identities

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Identity, PublicKey};
use crate::error::SyncError;

/// Resolves an identity to its published public key.
///
/// Implementations typically query a DID document or directory service.
#[async_trait]
pub trait PublicKeyResolver: Send + Sync {
    /// Look up the public key for `identity`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::KeyResolution` if the identity has no discoverable key.
    async fn resolve_public_key(&self, identity: &Identity) -> Result<PublicKey, SyncError>;
}

/// In-memory identity → public key directory.
#[derive(Default)]
pub struct KeyDirectory {
    keys: RwLock<HashMap<Identity, PublicKey>>,
}

impl KeyDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) the key for an identity.
    pub fn insert(&self, identity: Identity, key: PublicKey) {
        self.keys.write().insert(identity, key);
    }

    /// Withdraw an identity's key.
    pub fn remove(&self, identity: &Identity) -> Option<PublicKey> {
        self.keys.write().remove(identity)
    }

    /// Number of published keys
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl PublicKeyResolver for KeyDirectory {
    async fn resolve_public_key(&self, identity: &Identity) -> Result<PublicKey, SyncError> {
        self.keys
            .read()
            .get(identity)
            .copied()
            .ok_or_else(|| SyncError::KeyResolution {
                identity: identity.to_string(),
                reason: "no public key published".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[tokio::test]
    async fn test_resolve_known_identity() {
        let dir = KeyDirectory::new();
        let bob = Identity::parse("did:plc:bob").unwrap();
        let key = KeyPair::generate().public_key();
        dir.insert(bob.clone(), key);

        assert_eq!(dir.resolve_public_key(&bob).await.unwrap(), key);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_identity_fails() {
        let dir = KeyDirectory::new();
        let carol = Identity::parse("did:plc:carol").unwrap();

        let err = dir.resolve_public_key(&carol).await.unwrap_err();
        assert!(matches!(err, SyncError::KeyResolution { ref identity, .. } if identity == "did:plc:carol"));
    }

    #[tokio::test]
    async fn test_remove_withdraws_key() {
        let dir = KeyDirectory::new();
        let bob = Identity::parse("did:plc:bob").unwrap();
        dir.insert(bob.clone(), KeyPair::generate().public_key());
        assert!(dir.remove(&bob).is_some());
        assert!(dir.is_empty());
        assert!(dir.resolve_public_key(&bob).await.is_err());
    }
}
