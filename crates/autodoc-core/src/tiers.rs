//! Storage and encryption selection per document.
//!
//! [`select_tiers`] is a pure function from a document id to a [`TierPlan`];
//! [`StorageBackends::build_stack`] turns a plan into concrete adapters.
//!
//! | Document id        | Fast tier        | Slow tier                                          |
//! |--------------------|------------------|----------------------------------------------------|
//! | `catalog/<self>`   | local namespaced | own remote repo, encrypted with the self key       |
//! | `dm/<a>/<b>`       | local namespaced | counterpart's remote repo, encrypted with the DM key |
//! | anything else      | local namespaced | own remote repo, plaintext                         |

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::SyncError;
use crate::identity::{self_key, shared_secret, Identity, KeyPair, PublicKeyResolver};
use crate::storage::{EncryptedStorage, NamespacedStorage, RemoteStore, StorageAdapter};
use crate::types::{DocumentId, DocumentKind};

/// Where the low-latency copy lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastTier {
    /// The local store, namespaced by document id
    LocalNamespaced,
}

/// Which key seals an encrypted slow tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Derived from the local secret alone
    SelfKey,
    /// Agreed with the given counterpart's public key
    SharedWith(Identity),
}

/// Where the authoritative copy lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlowTier {
    /// Remote repository of `scope`, values stored as-is
    Plain {
        /// Owner of the remote repository
        scope: Identity,
    },
    /// Remote repository of `scope`, values sealed with `key`
    Encrypted {
        /// Owner of the remote repository
        scope: Identity,
        /// Key used to seal values
        key: KeySource,
    },
}

impl SlowTier {
    /// Owner of the remote repository
    pub fn scope(&self) -> &Identity {
        match self {
            SlowTier::Plain { scope } | SlowTier::Encrypted { scope, .. } => scope,
        }
    }
}

/// Both tiers chosen for one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPlan {
    /// Fast tier
    pub fast: FastTier,
    /// Slow tier
    pub slow: SlowTier,
}

impl fmt::Display for TierPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slow {
            SlowTier::Plain { scope } => write!(f, "local + plain@{scope}"),
            SlowTier::Encrypted {
                scope,
                key: KeySource::SelfKey,
            } => write!(f, "local + self-encrypted@{scope}"),
            SlowTier::Encrypted {
                scope,
                key: KeySource::SharedWith(other),
            } => write!(f, "local + shared({other})@{scope}"),
        }
    }
}

/// Decide the tiers for `doc_id` opened by `local`.
///
/// # Errors
///
/// `SyncError::InvalidDocumentId` for another identity's catalog and for a
/// dm id without a participant distinct from `local`.
pub fn select_tiers(doc_id: &DocumentId, local: &Identity) -> Result<TierPlan, SyncError> {
    let slow = match doc_id.kind() {
        DocumentKind::Catalog => {
            let owner = doc_id.participants().into_iter().next();
            if owner.as_ref() != Some(local) {
                return Err(SyncError::InvalidDocumentId(format!(
                    "{doc_id} is not the catalog of {local}"
                )));
            }
            SlowTier::Encrypted {
                scope: local.clone(),
                key: KeySource::SelfKey,
            }
        }
        DocumentKind::Dm => {
            let other = doc_id.counterpart(local)?;
            SlowTier::Encrypted {
                scope: other.clone(),
                key: KeySource::SharedWith(other),
            }
        }
        DocumentKind::Other(_) => SlowTier::Plain {
            scope: local.clone(),
        },
    };
    Ok(TierPlan {
        fast: FastTier::LocalNamespaced,
        slow,
    })
}

/// Concrete storage for one document
pub struct StorageStack {
    /// Fast tier adapter, already namespaced
    pub fast: Arc<dyn StorageAdapter>,
    /// Slow tier adapter, already namespaced and (if planned) encrypted
    pub slow: Arc<dyn StorageAdapter>,
}

/// Backing stores and collaborators used to build storage stacks
#[derive(Clone)]
pub struct StorageBackends {
    /// Local fast store shared by every document
    pub local: Arc<dyn StorageAdapter>,
    /// Remote slow store
    pub remote: Arc<dyn RemoteStore>,
    /// Public key lookup for dm counterparts
    pub key_resolver: Arc<dyn PublicKeyResolver>,
}

impl StorageBackends {
    /// Compose the adapters described by `plan`.
    ///
    /// # Errors
    ///
    /// `SyncError::KeyResolution` when a counterpart's public key cannot be
    /// found; `SyncError::Crypto` when key agreement fails.
    pub async fn build_stack(
        &self,
        plan: &TierPlan,
        doc_id: &DocumentId,
        keypair: &KeyPair,
    ) -> Result<StorageStack, SyncError> {
        let fast: Arc<dyn StorageAdapter> = match plan.fast {
            FastTier::LocalNamespaced => {
                Arc::new(NamespacedStorage::new(self.local.clone(), doc_id))
            }
        };

        let remote: Arc<dyn StorageAdapter> = Arc::new(NamespacedStorage::new(
            self.remote.scoped(plan.slow.scope()),
            doc_id,
        ));
        let slow: Arc<dyn StorageAdapter> = match &plan.slow {
            SlowTier::Plain { .. } => remote,
            SlowTier::Encrypted { key, .. } => {
                let key = match key {
                    KeySource::SelfKey => self_key(keypair)?,
                    KeySource::SharedWith(other) => {
                        let public = self.key_resolver.resolve_public_key(other).await?;
                        shared_secret(keypair, &public)?
                    }
                };
                debug!(doc_id = %doc_id, key_id = %hex::encode(key.key_id()), "Derived slow-tier key");
                Arc::new(EncryptedStorage::new(remote, &key))
            }
        };

        Ok(StorageStack { fast, slow })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyDirectory;
    use crate::storage::{MemoryRemote, MemoryStorage, StorageKey};

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_own_catalog_is_self_encrypted() {
        let alice = id("did:plc:alice");
        let plan = select_tiers(&DocumentId::catalog(&alice), &alice).unwrap();
        assert_eq!(plan.fast, FastTier::LocalNamespaced);
        assert_eq!(
            plan.slow,
            SlowTier::Encrypted {
                scope: alice.clone(),
                key: KeySource::SelfKey
            }
        );
    }

    #[test]
    fn test_foreign_catalog_rejected() {
        let alice = id("did:plc:alice");
        let bob = id("did:plc:bob");
        assert!(matches!(
            select_tiers(&DocumentId::catalog(&bob), &alice),
            Err(SyncError::InvalidDocumentId(_))
        ));
    }

    #[test]
    fn test_dm_uses_counterpart_scope_and_shared_key() {
        let alice = id("did:plc:alice");
        let bob = id("did:plc:bob");
        let plan = select_tiers(&DocumentId::dm(&alice, &bob), &alice).unwrap();
        assert_eq!(
            plan.slow,
            SlowTier::Encrypted {
                scope: bob.clone(),
                key: KeySource::SharedWith(bob)
            }
        );
    }

    #[test]
    fn test_malformed_dm_rejected() {
        let alice = id("did:plc:alice");
        for raw in ["dm/did:plc:alice", "dm/did:plc:alice/did:plc:alice", "dm/did:plc:x/did:plc:y"] {
            let doc = DocumentId::parse(raw).unwrap();
            assert!(
                matches!(select_tiers(&doc, &alice), Err(SyncError::InvalidDocumentId(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_other_kinds_are_plain() {
        let alice = id("did:plc:alice");
        let doc = DocumentId::parse("space/lobby").unwrap();
        let plan = select_tiers(&doc, &alice).unwrap();
        assert_eq!(plan.slow, SlowTier::Plain { scope: alice });
        assert!(plan.to_string().starts_with("local + plain@"));
    }

    fn backends(resolver: Arc<KeyDirectory>) -> (StorageBackends, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        (
            StorageBackends {
                local: Arc::new(MemoryStorage::new()),
                remote: remote.clone(),
                key_resolver: resolver,
            },
            remote,
        )
    }

    #[tokio::test]
    async fn test_dm_stack_is_readable_by_both_parties() {
        let (alice, bob) = (id("did:plc:alice"), id("did:plc:bob"));
        let (alice_keys, bob_keys) = (KeyPair::generate(), KeyPair::generate());
        let directory = Arc::new(KeyDirectory::new());
        directory.insert(alice.clone(), alice_keys.public_key());
        directory.insert(bob.clone(), bob_keys.public_key());

        let (backends, remote) = backends(directory);
        let doc = DocumentId::dm(&alice, &bob);
        let key = StorageKey::new(["snapshot"]);

        let alice_plan = select_tiers(&doc, &alice).unwrap();
        let alice_stack = backends.build_stack(&alice_plan, &doc, &alice_keys).await.unwrap();
        alice_stack.slow.put(&key, b"hi bob").await.unwrap();

        // Alice writes into bob's repository.
        assert_eq!(remote.repo(&bob).len(), 1);
        assert!(remote.repo(&alice).is_empty());

        // Bob reads the same record through a stack addressed at the same repository.
        let bob_view = StorageBackends {
            remote: Arc::new(BobsRepoAs(remote.clone(), bob.clone())),
            ..backends.clone()
        };
        let bob_stack = bob_view
            .build_stack(&select_tiers(&doc, &bob).unwrap(), &doc, &bob_keys)
            .await
            .unwrap();
        assert_eq!(bob_stack.slow.get(&key).await.unwrap().unwrap(), b"hi bob");
    }

    struct BobsRepoAs(Arc<MemoryRemote>, Identity);

    impl RemoteStore for BobsRepoAs {
        fn scoped(&self, _owner: &Identity) -> Arc<dyn StorageAdapter> {
            self.0.scoped(&self.1)
        }
    }

    #[tokio::test]
    async fn test_unresolvable_counterpart() {
        let alice = id("did:plc:alice");
        let carol = id("did:plc:carol");
        let (backends, _) = backends(Arc::new(KeyDirectory::new()));
        let doc = DocumentId::dm(&alice, &carol);
        let plan = select_tiers(&doc, &alice).unwrap();

        let err = backends
            .build_stack(&plan, &doc, &KeyPair::generate())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::KeyResolution { .. }));
    }
}
