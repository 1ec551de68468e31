//! Replicated documents
//!
//! A [`Document<T>`] is a cheap, cloneable handle to one Automerge replica
//! owned by a `Peer`. `T` is the serde shape of the materialized view.
//!
//! ```text
//! change(f) ──▶ AutoCommit (view updated) ──▶ fast tier (chunk, awaited)
//!                                         ├─▶ router (Ops frame)
//!                                         └─▶ slow tier (debounced flusher)
//! router Ops ──▶ load_incremental ──▶ fast tier + slow flush
//! ```

pub mod json;
mod replica;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use automerge::{AutoCommit, ChangeHash};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::sync::SyncEvent;
use crate::types::DocumentId;

pub use replica::DocumentHealth;
pub(crate) use replica::Replica;

/// Handle to a replicated document with view type `T`.
pub struct Document<T> {
    replica: Arc<Replica>,
    _view: PhantomData<fn() -> T>,
}

impl<T> Clone for Document<T> {
    fn clone(&self) -> Self {
        Self {
            replica: self.replica.clone(),
            _view: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Document<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", self.replica.id())
            .field("health", &self.replica.health())
            .finish()
    }
}

impl<T> Document<T> {
    pub(crate) fn from_replica(replica: Arc<Replica>) -> Self {
        Self {
            replica,
            _view: PhantomData,
        }
    }

    /// Document id
    pub fn id(&self) -> &DocumentId {
        self.replica.id()
    }

    /// Current view as untyped JSON.
    ///
    /// # Errors
    ///
    /// `DecryptionFailed` while the slow tier is blocked, `DocumentClosed`
    /// after close.
    pub fn view_json(&self) -> Result<serde_json::Value, SyncError> {
        self.replica.view_json()
    }

    /// Apply a local change.
    ///
    /// `f` runs against the Automerge document and its result is committed
    /// as one change; if `f` fails, its operations are rolled back. The
    /// change is visible in [`Document::view`] when this returns, whatever
    /// happened to the slow tier.
    pub async fn change<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, SyncError> + Send,
        R: Send,
    {
        self.replica.change(f).await
    }

    /// Current heads of the change graph
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.replica.heads()
    }

    /// Full Automerge save of the current state
    pub fn save(&self) -> Result<Vec<u8>, SyncError> {
        self.replica.save()
    }

    /// Whether the document is usable
    pub fn health(&self) -> DocumentHealth {
        self.replica.health()
    }

    /// Run one slow-tier merge-and-flush pass now instead of waiting for the flusher.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.replica.sync_slow().await
    }

    /// Whether both handles point at the same in-memory replica
    pub fn ptr_eq<U>(&self, other: &Document<U>) -> bool {
        Arc::ptr_eq(&self.replica, &other.replica)
    }

    /// Events concerning this document only
    pub fn subscribe(&self) -> DocumentEvents {
        DocumentEvents {
            doc_id: self.id().clone(),
            rx: self.replica.events(),
        }
    }
}

impl<T: DeserializeOwned> Document<T> {
    /// Current view, deserialized into `T`.
    pub fn view(&self) -> Result<T, SyncError> {
        serde_json::from_value(self.view_json()?).map_err(|e| {
            SyncError::Serialization(format!("view of {} does not match schema: {e}", self.id()))
        })
    }
}

/// Receiver of [`SyncEvent`]s filtered to one document
pub struct DocumentEvents {
    doc_id: DocumentId,
    rx: broadcast::Receiver<SyncEvent>,
}

impl DocumentEvents {
    /// Next event for this document.
    ///
    /// Lagging and channel closure are reported as the broadcast errors.
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if event.doc_id() == &self.doc_id {
                return Ok(event);
            }
        }
    }
}
