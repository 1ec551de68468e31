//! Catalog-driven discovery
//!
//! A [`Session`] owns one peer, its catalog and the dm channels listed in it.
//! The [`Orchestrator`] task watches the catalog and opens a `dm/<a>/<b>`
//! document for every listed identity that has none yet.
//!
//! ```text
//! Session::start
//!   ├── Peer::init
//!   ├── open catalog/<self> (catalog_init)
//!   ├── reconcile            ──▶ Peer::open(dm/<sorted>, channel_init) per new identity
//!   └── spawn Orchestrator   ──▶ reconcile on every catalog change (or lag)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{add_conversation, catalog_init, channel_init, Catalog, Channel};
use crate::doc::Document;
use crate::error::SyncError;
use crate::identity::Identity;
use crate::peer::{Peer, PeerConfig};
use crate::sync::SyncEvent;
use crate::types::DocumentId;

/// State shared by the orchestrator and whatever front end drives the session
pub struct AppContext {
    identity: Identity,
    peer: Peer,
    catalog: Document<Catalog>,
    dms: RwLock<BTreeMap<Identity, Document<Channel>>>,
    failures: RwLock<BTreeMap<Identity, String>>,
    dm_opened: Notify,
}

impl AppContext {
    /// Local identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The session's peer
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The local catalog
    pub fn catalog(&self) -> &Document<Catalog> {
        &self.catalog
    }

    /// Open dm channel with `other`
    pub fn dm(&self, other: &Identity) -> Option<Document<Channel>> {
        self.dms.read().get(other).cloned()
    }

    /// All open dm channels by counterpart
    pub fn dms(&self) -> BTreeMap<Identity, Document<Channel>> {
        self.dms.read().clone()
    }

    /// Identities whose dm could not be opened, with the last error
    pub fn failures(&self) -> BTreeMap<Identity, String> {
        self.failures.read().clone()
    }

    /// List `other` in the catalog; the orchestrator then opens the channel.
    pub async fn start_conversation(
        &self,
        other: &Identity,
        name: Option<&str>,
    ) -> Result<(), SyncError> {
        add_conversation(&self.catalog, other, name).await
    }

    /// Wait until the dm channel with `other` is open, up to `timeout`.
    pub async fn wait_for_dm(&self, other: &Identity, timeout: Duration) -> Option<Document<Channel>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.dm_opened.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(doc) = self.dm(other) {
                    return doc;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Open channels for catalog entries that have none. Returns how many opened.
    pub async fn reconcile(&self) -> usize {
        let catalog = match self.catalog.view() {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, "Catalog unreadable, skipping reconciliation");
                return 0;
            }
        };

        let mut opened = 0;
        for other in catalog.identities() {
            if other == self.identity || self.dms.read().contains_key(&other) {
                continue;
            }
            let id = DocumentId::dm(&self.identity, &other);
            match self.peer.open::<Channel>(&id, &channel_init()).await {
                Ok(doc) => {
                    info!(doc_id = %id, other = %other, "Opened dm channel");
                    self.failures.write().remove(&other);
                    self.dms.write().insert(other, doc);
                    self.dm_opened.notify_waiters();
                    opened += 1;
                }
                Err(e) => {
                    warn!(doc_id = %id, other = %other, error = %e, "Could not open dm channel");
                    self.failures.write().insert(other, e.to_string());
                }
            }
        }
        opened
    }
}

/// Background task reacting to catalog changes
pub struct Orchestrator {
    context: Arc<AppContext>,
    events: broadcast::Receiver<SyncEvent>,
}

impl Orchestrator {
    /// Orchestrator for `context`, consuming `events` from its peer
    pub fn new(context: Arc<AppContext>, events: broadcast::Receiver<SyncEvent>) -> Self {
        Self { context, events }
    }

    /// Run until the event channel closes.
    pub async fn run(mut self) {
        let catalog_id = self.context.catalog.id().clone();
        loop {
            match self.events.recv().await {
                Ok(event) if event.is_change() && event.doc_id() == &catalog_id => {
                    debug!(event = %event, "Catalog changed");
                    self.context.reconcile().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Orchestrator lagged behind events, rescanning catalog");
                    self.context.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Orchestrator stopped");
    }
}

/// A running peer with its catalog and orchestrator
pub struct Session {
    context: Arc<AppContext>,
    orchestrator: JoinHandle<()>,
}

impl Session {
    /// Start a peer, open its catalog and begin opening dm channels.
    ///
    /// # Errors
    ///
    /// Peer construction errors, and any error opening the catalog.
    pub async fn start(config: PeerConfig) -> Result<Self, SyncError> {
        let peer = Peer::init(config).await?;
        let events = peer.subscribe();
        let identity = peer.identity().clone();

        let catalog = match peer
            .open::<Catalog>(&DocumentId::catalog(&identity), &catalog_init())
            .await
        {
            Ok(catalog) => catalog,
            Err(e) => {
                peer.shutdown().await;
                return Err(e);
            }
        };

        let context = Arc::new(AppContext {
            identity,
            peer,
            catalog,
            dms: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(BTreeMap::new()),
            dm_opened: Notify::new(),
        });
        context.reconcile().await;
        let orchestrator = tokio::spawn(Orchestrator::new(context.clone(), events).run());

        info!(identity = %context.identity, "Session started");
        Ok(Self {
            context,
            orchestrator,
        })
    }

    /// Shared context
    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    /// Stop the orchestrator and shut the peer down.
    pub async fn shutdown(self) {
        self.orchestrator.abort();
        self.context.peer.shutdown().await;
        info!(identity = %self.context.identity, "Session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::identity::{KeyDirectory, KeyPair};
    use crate::storage::{MemoryRemote, MemoryStorage};
    use crate::sync::LocalRelay;
    use crate::tiers::StorageBackends;

    fn config(relay: &LocalRelay, directory: &Arc<KeyDirectory>, name: &str) -> PeerConfig {
        let identity = Identity::parse(name).unwrap();
        let keypair = KeyPair::generate();
        directory.insert(identity.clone(), keypair.public_key());
        PeerConfig {
            identity,
            keypair,
            auth: Arc::new(relay.clone()),
            router: Arc::new(relay.clone()),
            backends: StorageBackends {
                local: Arc::new(MemoryStorage::new()),
                remote: Arc::new(MemoryRemote::new()),
                key_resolver: directory.clone(),
            },
            settings: EngineConfig {
                router_url: relay.base_url().to_string(),
                ..EngineConfig::for_tests()
            },
        }
    }

    #[tokio::test]
    async fn test_catalog_entry_opens_dm() {
        let relay = LocalRelay::new("mem://relay");
        let directory = Arc::new(KeyDirectory::new());
        let bob = Identity::parse("did:plc:bob").unwrap();
        directory.insert(bob.clone(), KeyPair::generate().public_key());

        let session = Session::start(config(&relay, &directory, "did:plc:alice"))
            .await
            .unwrap();
        let ctx = session.context().clone();
        assert!(ctx.dms().is_empty());

        ctx.start_conversation(&bob, Some("Bob")).await.unwrap();
        let dm = ctx.wait_for_dm(&bob, Duration::from_secs(2)).await.unwrap();
        assert_eq!(dm.id(), &DocumentId::dm(ctx.identity(), &bob));
        assert!(dm.view().unwrap().messages.is_empty());

        let catalog = ctx.catalog().view().unwrap();
        assert_eq!(catalog.dms["did:plc:bob"].name.as_deref(), Some("Bob"));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_unresolvable_counterpart_is_recorded_and_isolated() {
        let relay = LocalRelay::new("mem://relay");
        let directory = Arc::new(KeyDirectory::new());
        let bob = Identity::parse("did:plc:bob").unwrap();
        let carol = Identity::parse("did:plc:carol").unwrap();
        directory.insert(bob.clone(), KeyPair::generate().public_key());

        let session = Session::start(config(&relay, &directory, "did:plc:alice"))
            .await
            .unwrap();
        let ctx = session.context().clone();
        ctx.start_conversation(&carol, None).await.unwrap();
        ctx.start_conversation(&bob, None).await.unwrap();

        assert!(ctx.wait_for_dm(&bob, Duration::from_secs(2)).await.is_some());
        tokio::time::timeout(Duration::from_secs(2), async {
            while !ctx.failures().contains_key(&carol) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(ctx.dm(&carol).is_none());

        // Publishing carol's key lets the next catalog change pick her up.
        directory.insert(carol.clone(), KeyPair::generate().public_key());
        ctx.start_conversation(&carol, Some("Carol")).await.unwrap();
        assert!(ctx.wait_for_dm(&carol, Duration::from_secs(2)).await.is_some());
        assert!(ctx.failures().is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_cannot_list_self() {
        let relay = LocalRelay::new("mem://relay");
        let directory = Arc::new(KeyDirectory::new());
        let session = Session::start(config(&relay, &directory, "did:plc:alice"))
            .await
            .unwrap();
        let ctx = session.context().clone();
        let me = ctx.identity().clone();
        assert!(matches!(
            ctx.start_conversation(&me, None).await,
            Err(SyncError::InvalidIdentity(_))
        ));
        session.shutdown().await;
    }
}
