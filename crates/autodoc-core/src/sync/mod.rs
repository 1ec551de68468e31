//! Replication plumbing between peers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  AuthProvider      router token for an identity              │
//! │  RouterTransport   connect(token, <router>/connect/as/<id>)  │
//! │  RouterConnection                                            │
//! │  ├── RouterSender  join / leave / send_ops                   │
//! │  └── receiver      encoded RouterFrames from other members   │
//! │                                                              │
//! │  LocalRelay        in-process AuthProvider + RouterTransport │
//! │  SyncEvent         lifecycle and persistence notifications   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod relay;
pub mod router;

pub use events::{ChangeOrigin, StorageTier, SyncEvent};
pub use relay::LocalRelay;
pub use router::{
    router_endpoint, AuthProvider, AuthToken, RouterConnection, RouterFrame, RouterSender,
    RouterTransport,
};
