//! In-process relay: a router for peers living in one process.
//!
//! `LocalRelay` plays both external roles a peer needs. As an
//! [`AuthProvider`] it issues tokens bound to an identity; as a
//! [`RouterTransport`] it accepts connections whose endpoint matches the
//! token's identity and fans frames out to the other members of each
//! document.
//!
//! ```text
//! peer A ──Join(doc)──▶ ┌──────────┐ ──Join(doc)──▶ peer B
//! peer A ──Ops(doc)───▶ │  relay   │ ──Ops(doc)───▶ peer B
//!                       └──────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::router::{
    router_endpoint, AuthProvider, AuthToken, RouterConnection, RouterFrame, RouterTransport,
};
use crate::error::SyncError;
use crate::identity::Identity;

type ConnId = u64;

#[derive(Default)]
struct RelayState {
    tokens: HashMap<AuthToken, Identity>,
    connections: HashMap<ConnId, mpsc::UnboundedSender<Bytes>>,
    members: HashMap<String, HashSet<ConnId>>,
}

struct RelayInner {
    base_url: String,
    state: Mutex<RelayState>,
    next_conn: AtomicU64,
    deny_tokens: AtomicBool,
    refuse_connections: AtomicBool,
}

/// Router and token issuer for peers in the same process.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl LocalRelay {
    /// Create a relay reachable under `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                base_url: base_url.into(),
                state: Mutex::new(RelayState::default()),
                next_conn: AtomicU64::new(1),
                deny_tokens: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// Base URL peers must connect under
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Endpoint for `identity`
    pub fn endpoint_for(&self, identity: &Identity) -> String {
        router_endpoint(&self.inner.base_url, identity)
    }

    /// Refuse (or resume) issuing tokens
    pub fn deny_tokens(&self, deny: bool) {
        self.inner.deny_tokens.store(deny, Ordering::SeqCst);
    }

    /// Refuse (or resume) accepting connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Number of connections that joined `doc_id`
    pub fn member_count(&self, doc_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .members
            .get(doc_id)
            .map_or(0, HashSet::len)
    }
}

impl RelayInner {
    fn handle_frame(&self, conn: ConnId, raw: Bytes) {
        let frame = match RouterFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let mut state = self.state.lock();
        match &frame {
            RouterFrame::Join { doc_id } => {
                state.members.entry(doc_id.clone()).or_default().insert(conn);
                debug!(conn, doc_id = %doc_id, "Joined");
            }
            RouterFrame::Leave { doc_id } => {
                if let Some(members) = state.members.get_mut(doc_id) {
                    members.remove(&conn);
                    if members.is_empty() {
                        state.members.remove(doc_id);
                    }
                }
                debug!(conn, doc_id = %doc_id, "Left");
                return;
            }
            RouterFrame::Ops { doc_id, .. } => {
                let is_member = state
                    .members
                    .get(doc_id)
                    .is_some_and(|members| members.contains(&conn));
                if !is_member {
                    warn!(conn, doc_id = %doc_id, "Dropping ops from non-member");
                    return;
                }
            }
        }

        // Join and Ops are forwarded to every other member.
        let targets: Vec<ConnId> = state
            .members
            .get(frame.doc_id())
            .map(|members| members.iter().copied().filter(|c| *c != conn).collect())
            .unwrap_or_default();
        for target in targets {
            if let Some(tx) = state.connections.get(&target) {
                let _ = tx.send(raw.clone());
            }
        }
    }

    fn disconnect(&self, conn: ConnId) {
        let mut state = self.state.lock();
        state.connections.remove(&conn);
        state.members.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
        debug!(conn, "Connection closed");
    }
}

#[async_trait]
impl AuthProvider for LocalRelay {
    async fn router_token(&self, identity: &Identity) -> Result<AuthToken, SyncError> {
        if self.inner.deny_tokens.load(Ordering::SeqCst) {
            return Err(SyncError::Auth(format!("token request for {identity} denied")));
        }
        let mut raw = [0u8; 24];
        rand::rng().fill_bytes(&mut raw);
        let token = AuthToken::new(hex::encode(raw));
        self.inner
            .state
            .lock()
            .tokens
            .insert(token.clone(), identity.clone());
        Ok(token)
    }
}

#[async_trait]
impl RouterTransport for LocalRelay {
    async fn connect(
        &self,
        token: &AuthToken,
        endpoint: &str,
    ) -> Result<RouterConnection, SyncError> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(SyncError::RouterConnect(format!("{endpoint}: connection refused")));
        }

        let identity = self
            .inner
            .state
            .lock()
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| SyncError::RouterConnect("unknown token".to_string()))?;
        if endpoint != self.endpoint_for(&identity) {
            return Err(SyncError::RouterConnect(format!(
                "token for {identity} cannot connect to {endpoint}"
            )));
        }

        let conn = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        let (to_peer, from_relay) = mpsc::unbounded_channel();
        let (to_relay, mut from_peer) = mpsc::unbounded_channel::<Bytes>();
        self.inner.state.lock().connections.insert(conn, to_peer);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(raw) = from_peer.recv().await {
                inner.handle_frame(conn, raw);
            }
            inner.disconnect(conn);
        });

        info!(conn, identity = %identity, "Router connection accepted");
        Ok(RouterConnection::new(to_relay, from_relay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;
    use std::time::Duration;

    const BASE: &str = "wss://relay.test";

    async fn connect(relay: &LocalRelay, name: &str) -> RouterConnection {
        let identity = Identity::parse(name).unwrap();
        let token = relay.router_token(&identity).await.unwrap();
        relay
            .connect(&token, &relay.endpoint_for(&identity))
            .await
            .unwrap()
    }

    async fn recv(conn: &mut RouterConnection) -> RouterFrame {
        let raw = tokio::time::timeout(Duration::from_secs(1), conn.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        RouterFrame::decode(&raw).unwrap()
    }

    async fn wait_members(relay: &LocalRelay, doc_id: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.member_count(doc_id) != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ops_fan_out_to_other_members() {
        let relay = LocalRelay::new(BASE);
        let mut a = connect(&relay, "did:plc:a").await;
        let mut b = connect(&relay, "did:plc:b").await;
        let doc = DocumentId::parse("space/lobby").unwrap();

        a.sender.join(&doc).unwrap();
        wait_members(&relay, "space/lobby", 1).await;
        b.sender.join(&doc).unwrap();

        // A learns that B joined.
        assert_eq!(recv(&mut a).await, RouterFrame::Join { doc_id: doc.to_string() });

        a.sender.send_ops(&doc, b"change").unwrap();
        match recv(&mut b).await {
            RouterFrame::Ops { ops, .. } => assert_eq!(ops, b"change"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relay.member_count("space/lobby"), 2);
    }

    #[tokio::test]
    async fn test_token_must_match_endpoint() {
        let relay = LocalRelay::new(BASE);
        let alice = Identity::parse("did:plc:alice").unwrap();
        let bob = Identity::parse("did:plc:bob").unwrap();
        let token = relay.router_token(&alice).await.unwrap();

        let err = relay
            .connect(&token, &relay.endpoint_for(&bob))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::RouterConnect(_)));

        let bogus = AuthToken::new("nope");
        assert!(relay.connect(&bogus, &relay.endpoint_for(&alice)).await.is_err());
    }

    #[tokio::test]
    async fn test_denied_tokens_and_refused_connections() {
        let relay = LocalRelay::new(BASE);
        let alice = Identity::parse("did:plc:alice").unwrap();

        relay.deny_tokens(true);
        assert!(matches!(relay.router_token(&alice).await, Err(SyncError::Auth(_))));
        relay.deny_tokens(false);

        let token = relay.router_token(&alice).await.unwrap();
        relay.refuse_connections(true);
        let err = relay
            .connect(&token, &relay.endpoint_for(&alice))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::RouterConnect(_)));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_membership() {
        let relay = LocalRelay::new(BASE);
        let a = connect(&relay, "did:plc:a").await;
        let doc = DocumentId::parse("space/lobby").unwrap();
        a.sender.join(&doc).unwrap();
        wait_members(&relay, "space/lobby", 1).await;

        drop(a);
        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(relay.member_count("space/lobby"), 0);
    }
}
