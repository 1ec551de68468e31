//! Peer: owner of open documents and of the router connection
//!
//! One peer per identity and process. The registry maps each open
//! [`DocumentId`] to a `OnceCell` holding its replica; it is both the set of
//! open documents and the routing table used by the inbound dispatcher.
//!
//! ```text
//! Peer::init ──▶ AuthProvider::router_token ──▶ RouterTransport::connect
//!                                                   │
//!             ┌──────────── dispatcher task ◀───────┘ (inbound frames)
//!             ▼
//!   registry: DocumentId ─▶ OnceCell<Replica>
//!             ▲
//! Peer::open ─┴─ select_tiers ─▶ build_stack ─▶ Replica::load ─▶ announce
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::doc::{Document, Replica};
use crate::error::SyncError;
use crate::identity::{Identity, KeyPair};
use crate::sync::{
    router_endpoint, AuthProvider, RouterFrame, RouterSender, RouterTransport, SyncEvent,
};
use crate::tiers::{select_tiers, StorageBackends};
use crate::types::DocumentId;

type Registry = Mutex<HashMap<DocumentId, Arc<OnceCell<Arc<Replica>>>>>;

/// Everything a peer needs at construction
#[derive(Clone)]
pub struct PeerConfig {
    /// Local identity
    pub identity: Identity,
    /// Local signing key; source of every derived storage key
    pub keypair: KeyPair,
    /// Issues router tokens
    pub auth: Arc<dyn AuthProvider>,
    /// Opens router connections
    pub router: Arc<dyn RouterTransport>,
    /// Fast and slow storage plus public key lookup
    pub backends: StorageBackends,
    /// Tunables
    pub settings: EngineConfig,
}

struct PeerInner {
    identity: Identity,
    keypair: KeyPair,
    backends: StorageBackends,
    settings: Arc<EngineConfig>,
    sender: RouterSender,
    events: broadcast::Sender<SyncEvent>,
    registry: Arc<Registry>,
    flushers: Mutex<HashMap<DocumentId, JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Handle to a running peer. Clones share the same state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Authenticate, connect to the router and start dispatching inbound frames.
    ///
    /// # Errors
    ///
    /// `SyncError::Config` for invalid settings, `SyncError::Auth` when no
    /// token is issued and `SyncError::RouterConnect` when the connection is
    /// refused. No peer exists after an error.
    pub async fn init(config: PeerConfig) -> Result<Self, SyncError> {
        let PeerConfig {
            identity,
            keypair,
            auth,
            router,
            backends,
            settings,
        } = config;
        settings.validate()?;

        let token = auth.router_token(&identity).await.map_err(|e| match e {
            SyncError::Auth(_) => e,
            other => SyncError::Auth(other.to_string()),
        })?;
        let endpoint = router_endpoint(&settings.router_url, &identity);
        let connection = router.connect(&token, &endpoint).await.map_err(|e| match e {
            SyncError::RouterConnect(_) => e,
            other => SyncError::RouterConnect(format!("{endpoint}: {other}")),
        })?;

        let (events, _) = broadcast::channel(settings.event_capacity);
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch(
            identity.clone(),
            registry.clone(),
            connection.receiver,
        ));

        info!(identity = %identity, endpoint = %endpoint, "Peer connected to router");
        Ok(Self {
            inner: Arc::new(PeerInner {
                identity,
                keypair,
                backends,
                settings: Arc::new(settings),
                sender: connection.sender,
                events,
                registry,
                flushers: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(Some(dispatcher)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Local identity
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Settings this peer runs with
    pub fn settings(&self) -> &EngineConfig {
        &self.inner.settings
    }

    /// Events for every document of this peer
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Open `id`, or return the already open document.
    ///
    /// Loads from the fast tier, else the slow tier, else `initial_bytes`.
    /// Concurrent calls for the same id share one load; all of them get
    /// handles to the same replica.
    ///
    /// # Errors
    ///
    /// `InvalidDocumentId` when this identity may not open `id`,
    /// `KeyResolution` when a dm counterpart's key is unknown, and
    /// `DecryptionFailed` when stored data cannot be decrypted, and
    /// `PeerShutDown` once `shutdown` has started. A failed open leaves
    /// nothing registered.
    pub async fn open<T>(
        &self,
        id: &DocumentId,
        initial_bytes: &[u8],
    ) -> Result<Document<T>, SyncError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::PeerShutDown(self.inner.identity.to_string()));
        }

        let cell = self
            .inner
            .registry
            .lock()
            .entry(id.clone())
            .or_default()
            .clone();

        match cell
            .get_or_try_init(|| self.load_replica(id, initial_bytes))
            .await
        {
            Ok(replica) => {
                if self.inner.shut_down.load(Ordering::SeqCst) {
                    // Finished loading after shutdown walked the registry.
                    self.close(id).await;
                    return Err(SyncError::PeerShutDown(self.inner.identity.to_string()));
                }
                replica.announce();
                Ok(Document::from_replica(replica.clone()))
            }
            Err(e) => {
                {
                    // Waiters on the same cell retry its initialiser; only the
                    // last holder may drop the registration.
                    let mut registry = self.inner.registry.lock();
                    if registry.get(id).is_some_and(|c| {
                        Arc::ptr_eq(c, &cell) && c.get().is_none() && Arc::strong_count(&cell) == 2
                    }) {
                        registry.remove(id);
                    }
                }
                warn!(doc_id = %id, error = %e, "Open failed");
                Err(e)
            }
        }
    }

    async fn load_replica(
        &self,
        id: &DocumentId,
        initial_bytes: &[u8],
    ) -> Result<Arc<Replica>, SyncError> {
        let inner = &self.inner;
        let plan = select_tiers(id, &inner.identity)?;
        debug!(doc_id = %id, plan = %plan, "Selected storage tiers");
        let stack = inner.backends.build_stack(&plan, id, &inner.keypair).await?;

        let replica = Replica::load(
            id.clone(),
            stack,
            initial_bytes,
            inner.settings.clone(),
            inner.sender.clone(),
            inner.events.clone(),
        )
        .await?;

        let flusher = replica.spawn_flusher();
        inner.flushers.lock().insert(id.clone(), flusher);
        info!(doc_id = %id, "Document opened");
        let _ = inner.events.send(SyncEvent::DocumentOpened {
            doc_id: id.clone(),
        });
        Ok(replica)
    }

    /// Handle to `id` if it is open
    pub fn get<T>(&self, id: &DocumentId) -> Option<Document<T>> {
        let replica = self
            .inner
            .registry
            .lock()
            .get(id)
            .and_then(|cell| cell.get().cloned())?;
        Some(Document::from_replica(replica))
    }

    /// Whether `id` is open (loading does not count)
    pub fn is_open(&self, id: &DocumentId) -> bool {
        self.inner
            .registry
            .lock()
            .get(id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Ids of all open documents, sorted
    pub fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close `id`: final slow flush, leave the router, unregister.
    ///
    /// Handles still held elsewhere report `DocumentHealth::Closed`.
    /// Returns whether the document was open.
    pub async fn close(&self, id: &DocumentId) -> bool {
        let replica = {
            let mut registry = self.inner.registry.lock();
            let open = registry.get(id).and_then(|cell| cell.get().cloned());
            if open.is_some() {
                registry.remove(id);
            }
            open
        };
        let Some(replica) = replica else {
            return false;
        };
        replica.close().await;
        let flusher = self.inner.flushers.lock().remove(id);
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                warn!(doc_id = %id, error = %e, "Flusher task ended abnormally");
            }
        }
        true
    }

    /// Close every document and stop dispatching. Further opens fail.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(identity = %self.inner.identity, "Shutting down peer");
        for id in self.open_documents() {
            self.close(&id).await;
        }
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }
}

/// Route inbound frames to registered replicas until the connection closes.
async fn dispatch(
    identity: Identity,
    registry: Arc<Registry>,
    mut incoming: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(raw) = incoming.recv().await {
        let frame = match RouterFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Dropping undecodable frame");
                continue;
            }
        };
        let doc_id = match DocumentId::parse(frame.doc_id()) {
            Ok(id) => id,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Dropping frame with invalid document id");
                continue;
            }
        };
        let replica = registry
            .lock()
            .get(&doc_id)
            .and_then(|cell| cell.get().cloned());
        let Some(replica) = replica else {
            debug!(identity = %identity, doc_id = %doc_id, "Dropping frame for unopened document");
            continue;
        };

        match frame {
            RouterFrame::Ops { ops, .. } => {
                if let Err(e) = replica.apply_remote(&ops).await {
                    warn!(doc_id = %doc_id, error = %e, "Could not merge remote ops");
                }
            }
            RouterFrame::Join { .. } => replica.send_full_state(),
            RouterFrame::Leave { .. } => debug!(doc_id = %doc_id, "Member left"),
        }
    }
    info!(identity = %identity, "Router connection closed");
}
