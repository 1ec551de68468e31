//! Router protocol: frames, auth and transport seams.
//!
//! A peer holds one persistent connection to the router. Documents join the
//! connection by id, then exchange operation-log fragments with every other
//! member of the same document.
//!
//! ## Wire Format
//!
//! Every frame is `postcard(RouterFrame)`:
//!
//! - **Join**: start receiving a document; members answer with their state
//! - **Leave**: stop receiving a document
//! - **Ops**: Automerge changes (incremental or full save) for a document

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::identity::Identity;
use crate::types::DocumentId;

/// Message exchanged with the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterFrame {
    /// Register interest in a document
    Join {
        /// Document id string
        doc_id: String,
    },
    /// Withdraw interest in a document
    Leave {
        /// Document id string
        doc_id: String,
    },
    /// Operation-log bytes for a document
    Ops {
        /// Document id string
        doc_id: String,
        /// Automerge change bytes
        ops: Vec<u8>,
    },
}

impl RouterFrame {
    /// Encode for the wire
    pub fn encode(&self) -> Result<Bytes, SyncError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Document the frame is about
    pub fn doc_id(&self) -> &str {
        match self {
            RouterFrame::Join { doc_id }
            | RouterFrame::Leave { doc_id }
            | RouterFrame::Ops { doc_id, .. } => doc_id,
        }
    }
}

/// Bearer token scoped to the router
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a token string
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(..{} chars)", self.0.len())
    }
}

/// Issues router tokens for an identity (the identity provider's token call).
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Fetch a router token for `identity`.
    ///
    /// # Errors
    ///
    /// `SyncError::Auth` when no token can be obtained.
    async fn router_token(&self, identity: &Identity) -> Result<AuthToken, SyncError>;
}

/// Opens router connections.
#[async_trait]
pub trait RouterTransport: Send + Sync {
    /// Connect to `endpoint` using `token`.
    ///
    /// # Errors
    ///
    /// `SyncError::RouterConnect` when the connection cannot be established.
    async fn connect(&self, token: &AuthToken, endpoint: &str)
        -> Result<RouterConnection, SyncError>;
}

/// Endpoint a peer connects to: `<base>/connect/as/<identity>`
pub fn router_endpoint(base: &str, identity: &Identity) -> String {
    format!("{}/connect/as/{}", base.trim_end_matches('/'), identity)
}

/// An established router connection
pub struct RouterConnection {
    /// Outgoing half, cloneable
    pub sender: RouterSender,
    /// Incoming encoded frames
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl RouterConnection {
    /// Build a connection from its two channel halves
    pub fn new(outgoing: mpsc::UnboundedSender<Bytes>, incoming: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            sender: RouterSender { tx: outgoing },
            receiver: incoming,
        }
    }
}

/// Outgoing half of a router connection
#[derive(Clone)]
pub struct RouterSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl RouterSender {
    /// Start receiving `doc_id`
    pub fn join(&self, doc_id: &DocumentId) -> Result<(), SyncError> {
        self.send(RouterFrame::Join {
            doc_id: doc_id.to_string(),
        })
    }

    /// Stop receiving `doc_id`
    pub fn leave(&self, doc_id: &DocumentId) -> Result<(), SyncError> {
        self.send(RouterFrame::Leave {
            doc_id: doc_id.to_string(),
        })
    }

    /// Send change bytes for `doc_id` to the other members
    pub fn send_ops(&self, doc_id: &DocumentId, ops: &[u8]) -> Result<(), SyncError> {
        self.send(RouterFrame::Ops {
            doc_id: doc_id.to_string(),
            ops: ops.to_vec(),
        })
    }

    /// Whether the router side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, frame: RouterFrame) -> Result<(), SyncError> {
        self.tx
            .send(frame.encode()?)
            .map_err(|_| SyncError::Router("router connection closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let frame = RouterFrame::Ops {
            doc_id: "dm/did:plc:a/did:plc:b".into(),
            ops: vec![1, 2, 3],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(RouterFrame::decode(&bytes).unwrap(), frame);
        assert_eq!(frame.doc_id(), "dm/did:plc:a/did:plc:b");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            RouterFrame::decode(&[0xFF, 0xFF, 0xFF]),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn test_endpoint_format() {
        let alice = Identity::parse("did:plc:alice").unwrap();
        assert_eq!(
            router_endpoint("wss://router.example/", &alice),
            "wss://router.example/connect/as/did:plc:alice"
        );
    }

    #[tokio::test]
    async fn test_sender_writes_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let conn = RouterConnection::new(tx, in_rx);
        let doc = DocumentId::parse("space/lobby").unwrap();

        conn.sender.join(&doc).unwrap();
        conn.sender.send_ops(&doc, b"ops").unwrap();

        let first = RouterFrame::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first, RouterFrame::Join { doc_id: "space/lobby".into() });
        let second = RouterFrame::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(second, RouterFrame::Ops { ops, .. } if ops == b"ops"));
    }

    #[tokio::test]
    async fn test_send_after_close_is_router_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let conn = RouterConnection::new(tx, in_rx);
        drop(rx);
        assert!(conn.sender.is_closed());
        let doc = DocumentId::parse("space/lobby").unwrap();
        assert!(matches!(conn.sender.join(&doc), Err(SyncError::Router(_))));
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AuthToken::new("super-secret");
        assert!(!format!("{token:?}").contains("secret"));
    }
}
