//! Autodoc Core Library
//!
//! Encrypted, peer-managed replication of Automerge documents over a relay.
//!
//! ## Overview
//!
//! A [`Peer`] owns the router connection and every open [`Document`]. Each
//! document keeps a low-latency copy in a local fast tier and an
//! authoritative copy in a remote slow tier; which tiers and which key are
//! used follows from the [`DocumentId`] alone (see [`tiers::select_tiers`]).
//!
//! - `catalog/<self>`: the owner's conversation list, encrypted with a key
//!   only the owner can derive
//! - `dm/<a>/<b>`: a two-party channel, encrypted with a key both parties
//!   derive from their own secret and the other's public key
//! - anything else: stored as-is
//!
//! ## Quick Start
//!
//! ```ignore
//! use autodoc_core::{catalog, PeerConfig, Session};
//!
//! let session = Session::start(config).await?;
//! let ctx = session.context();
//!
//! // Listing bob in the catalog makes the orchestrator open dm/<alice>/<bob>.
//! ctx.start_conversation(&bob, Some("Bob")).await?;
//! let dm = ctx.wait_for_dm(&bob, Duration::from_secs(5)).await.unwrap();
//! catalog::post_message(&dm, ctx.identity(), "hi bob").await?;
//! ```

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod doc;
pub mod error;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod peer;
pub mod storage;
pub mod sync;
pub mod tiers;
pub mod types;

// Re-exports
pub use catalog::{Catalog, Channel, ChannelMessage, ConversationMeta};
pub use config::{EngineConfig, LoggingConfig, RetryPolicy};
pub use doc::{Document, DocumentEvents, DocumentHealth};
pub use error::{SyncError, SyncResult};
pub use identity::{Identity, KeyDirectory, KeyPair, PublicKey, PublicKeyResolver, SymmetricKey};
pub use orchestrator::{AppContext, Orchestrator, Session};
pub use peer::{Peer, PeerConfig};
pub use storage::{
    EncryptedStorage, MemoryRemote, MemoryStorage, NamespacedStorage, RedbStorage, RemoteStore,
    StorageAdapter, StorageKey,
};
pub use sync::{
    AuthProvider, AuthToken, ChangeOrigin, LocalRelay, RouterFrame, RouterTransport,
    StorageTier, SyncEvent,
};
pub use tiers::{select_tiers, StorageBackends, TierPlan};
pub use types::{DocumentId, DocumentKind};

pub use automerge;
