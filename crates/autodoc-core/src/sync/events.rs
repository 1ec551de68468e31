//! Notifications about document lifecycle and persistence
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SyncEvent (broadcast to every Peer subscriber)             │
//! │  ├── DocumentOpened                                         │
//! │  ├── DocumentChanged { origin: Local | Remote | Storage }   │
//! │  ├── Persisted { tier }                                     │
//! │  ├── PersistFailed { tier, message, will_retry }            │
//! │  ├── SlowTierBlocked { reason }                             │
//! │  └── DocumentClosed                                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::types::DocumentId;

/// Storage tier of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageTier {
    /// Low-latency local copy
    Fast,
    /// Authoritative remote copy
    Slow,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Fast => write!(f, "fast"),
            StorageTier::Slow => write!(f, "slow"),
        }
    }
}

/// Where a change to a document's view came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local `change` call
    Local,
    /// Operations received over the router
    Remote,
    /// State merged from the slow tier
    Storage,
}

/// Event emitted by a peer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A document finished loading and is registered
    DocumentOpened {
        /// Document
        doc_id: DocumentId,
    },
    /// The materialized view changed
    DocumentChanged {
        /// Document
        doc_id: DocumentId,
        /// Source of the change
        origin: ChangeOrigin,
    },
    /// A tier write completed
    Persisted {
        /// Document
        doc_id: DocumentId,
        /// Tier written
        tier: StorageTier,
    },
    /// A tier write failed
    PersistFailed {
        /// Document
        doc_id: DocumentId,
        /// Tier that failed
        tier: StorageTier,
        /// Error description
        message: String,
        /// Whether the write will be attempted again
        will_retry: bool,
    },
    /// Slow-tier data cannot be decrypted; the document is unusable
    SlowTierBlocked {
        /// Document
        doc_id: DocumentId,
        /// Decryption error
        reason: String,
    },
    /// The document was closed
    DocumentClosed {
        /// Document
        doc_id: DocumentId,
    },
}

impl SyncEvent {
    /// The document this event is about
    pub fn doc_id(&self) -> &DocumentId {
        match self {
            SyncEvent::DocumentOpened { doc_id }
            | SyncEvent::DocumentChanged { doc_id, .. }
            | SyncEvent::Persisted { doc_id, .. }
            | SyncEvent::PersistFailed { doc_id, .. }
            | SyncEvent::SlowTierBlocked { doc_id, .. }
            | SyncEvent::DocumentClosed { doc_id } => doc_id,
        }
    }

    /// Whether this event reports a change to the view
    pub fn is_change(&self) -> bool {
        matches!(self, SyncEvent::DocumentChanged { .. })
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::DocumentOpened { doc_id } => write!(f, "{doc_id}: opened"),
            SyncEvent::DocumentChanged { doc_id, origin } => {
                write!(f, "{doc_id}: changed ({origin:?})")
            }
            SyncEvent::Persisted { doc_id, tier } => write!(f, "{doc_id}: persisted to {tier}"),
            SyncEvent::PersistFailed {
                doc_id,
                tier,
                message,
                will_retry,
            } => write!(
                f,
                "{doc_id}: {tier} write failed: {message}{}",
                if *will_retry { " (will retry)" } else { "" }
            ),
            SyncEvent::SlowTierBlocked { doc_id, reason } => {
                write!(f, "{doc_id}: blocked: {reason}")
            }
            SyncEvent::DocumentClosed { doc_id } => write!(f, "{doc_id}: closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_accessor() {
        let doc_id = DocumentId::parse("space/lobby").unwrap();
        let event = SyncEvent::PersistFailed {
            doc_id: doc_id.clone(),
            tier: StorageTier::Slow,
            message: "timeout".into(),
            will_retry: true,
        };
        assert_eq!(event.doc_id(), &doc_id);
        assert!(!event.is_change());
        assert_eq!(
            event.to_string(),
            "space/lobby: slow write failed: timeout (will retry)"
        );
    }

    #[test]
    fn test_is_change() {
        let event = SyncEvent::DocumentChanged {
            doc_id: DocumentId::parse("space/lobby").unwrap(),
            origin: ChangeOrigin::Remote,
        };
        assert!(event.is_change());
    }
}
