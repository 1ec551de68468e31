//! Shared state behind every `Document` handle: the Automerge document plus
//! its two storage tiers and router registration.
//!
//! ## Persistence layout (inside the document's namespace)
//!
//! ```text
//! ["incremental", <blake3(change bytes)>]   one chunk per change (fast tier)
//! ["snapshot",    <blake3(heads)>]          compacted full save
//! ```
//!
//! Fast tier: a chunk per change, compacted into a snapshot after
//! `compaction_threshold` chunks. A failed write marks the tier dirty and the
//! next write is a full snapshot.
//!
//! Slow tier: a background flusher merges whatever is already stored, then
//! writes snapshots (debounced, exponential backoff on failure). It only
//! deletes keys whose content it has merged or written itself. Records that
//! cannot be decrypted block the document and are never overwritten.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use automerge::{AutoCommit, ChangeHash, ReadDoc, ROOT};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::json;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::storage::{StorageAdapter, StorageKey};
use crate::sync::{ChangeOrigin, RouterSender, StorageTier, SyncEvent};
use crate::tiers::StorageStack;
use crate::types::DocumentId;

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";

fn chunk_key(bytes: &[u8]) -> StorageKey {
    StorageKey::new([INCREMENTAL.to_string(), blake3::hash(bytes).to_hex().to_string()])
}

fn snapshot_key(heads: &[ChangeHash]) -> StorageKey {
    let mut hasher = blake3::Hasher::new();
    for head in heads {
        hasher.update(&head.0);
    }
    StorageKey::new([SNAPSHOT.to_string(), hasher.finalize().to_hex().to_string()])
}

/// Whether a document can currently be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentHealth {
    /// Readable and writable
    Healthy,
    /// Slow-tier records cannot be decrypted; reads and writes fail
    Blocked {
        /// Decryption error
        reason: String,
    },
    /// Closed by its peer
    Closed,
}

#[derive(Default)]
struct FastState {
    chunks: Vec<StorageKey>,
    snapshots: Vec<StorageKey>,
    dirty: bool,
}

#[derive(Default)]
struct SlowState {
    /// Keys whose content is contained in the in-memory document
    known: BTreeSet<StorageKey>,
    /// Keys that decrypted but did not parse; left untouched
    unreadable: BTreeSet<StorageKey>,
    merged: bool,
}

pub(crate) struct Replica {
    id: DocumentId,
    doc: Mutex<AutoCommit>,
    fast: Arc<dyn StorageAdapter>,
    slow: Arc<dyn StorageAdapter>,
    settings: Arc<EngineConfig>,
    router: RouterSender,
    events: broadcast::Sender<SyncEvent>,
    fast_state: tokio::sync::Mutex<FastState>,
    slow_state: tokio::sync::Mutex<SlowState>,
    sync_lock: tokio::sync::Mutex<()>,
    slow_dirty: AtomicBool,
    blocked: RwLock<Option<String>>,
    closed: AtomicBool,
    announced: AtomicBool,
    flush_signal: Notify,
    close_signal: Notify,
}

async fn read_all(
    adapter: &dyn StorageAdapter,
) -> Result<Vec<(StorageKey, Vec<u8>)>, SyncError> {
    let mut entries = Vec::new();
    for key in adapter.list_keys(&StorageKey::root()).await? {
        if let Some(bytes) = adapter.get(&key).await? {
            entries.push((key, bytes));
        }
    }
    Ok(entries)
}

impl Replica {
    /// Load from the fast tier, else the slow tier, else `initial_bytes`.
    ///
    /// # Errors
    ///
    /// `SyncError::DecryptionFailed` when the slow tier has to be read and
    /// holds records the derived key cannot open.
    pub(crate) async fn load(
        id: DocumentId,
        stack: StorageStack,
        initial_bytes: &[u8],
        settings: Arc<EngineConfig>,
        router: RouterSender,
        events: broadcast::Sender<SyncEvent>,
    ) -> Result<Arc<Self>, SyncError> {
        let mut doc = AutoCommit::new();
        let mut fast_state = FastState::default();
        let mut slow_state = SlowState::default();
        let mut slow_dirty = false;

        match read_all(stack.fast.as_ref()).await {
            Ok(entries) => {
                for (key, bytes) in entries {
                    if let Err(e) = doc.load_incremental(&bytes) {
                        warn!(doc_id = %id, key = %key, error = %e, "Skipping unreadable fast-tier record");
                        fast_state.dirty = true;
                    }
                    match key.segments().first().map(String::as_str) {
                        Some(SNAPSHOT) => fast_state.snapshots.push(key),
                        _ => fast_state.chunks.push(key),
                    }
                }
            }
            Err(e) => {
                warn!(doc_id = %id, error = %e, "Fast tier unreadable, falling back to slow tier");
                fast_state.dirty = true;
            }
        }

        let from_fast = !doc.get_heads().is_empty();
        if from_fast {
            debug!(doc_id = %id, chunks = fast_state.chunks.len(), "Loaded from fast tier");
            slow_dirty = true;
        } else {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match read_all(stack.slow.as_ref()).await {
                    Ok(entries) => {
                        for (key, bytes) in entries {
                            if let Err(e) = doc.load_incremental(&bytes) {
                                warn!(doc_id = %id, key = %key, error = %e, "Skipping unparsable slow-tier record");
                                slow_state.unreadable.insert(key);
                            } else {
                                slow_state.known.insert(key);
                            }
                        }
                        slow_state.merged = true;
                        break;
                    }
                    Err(SyncError::DecryptionFailed(reason)) => {
                        error!(doc_id = %id, reason = %reason, "Slow-tier records cannot be decrypted");
                        return Err(SyncError::DecryptionFailed(format!("{id}: {reason}")));
                    }
                    Err(e) if e.is_retryable() && attempt < settings.slow_load_attempts => {
                        let delay = settings.retry.delay_for(attempt);
                        warn!(doc_id = %id, attempt, error = %e, ?delay, "Slow-tier read failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        warn!(doc_id = %id, error = %e, "Slow tier unavailable, opening without it");
                        break;
                    }
                }
            }
            fast_state.dirty = true;

            if doc.get_heads().is_empty() {
                if !initial_bytes.is_empty() {
                    doc.load_incremental(initial_bytes)?;
                }
                debug!(doc_id = %id, "Initialized from initial bytes");
                slow_dirty = !doc.get_heads().is_empty();
            }
        }

        let replica = Arc::new(Self {
            id,
            doc: Mutex::new(doc),
            fast: stack.fast,
            slow: stack.slow,
            settings,
            router,
            events,
            fast_state: tokio::sync::Mutex::new(fast_state),
            slow_state: tokio::sync::Mutex::new(slow_state),
            sync_lock: tokio::sync::Mutex::new(()),
            slow_dirty: AtomicBool::new(slow_dirty),
            blocked: RwLock::new(None),
            closed: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            flush_signal: Notify::new(),
            close_signal: Notify::new(),
        });
        let needs_snapshot = replica.fast_state.lock().await.dirty;
        if needs_snapshot {
            replica.persist_fast(None).await;
        }
        Ok(replica)
    }

    pub(crate) fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn health(&self) -> DocumentHealth {
        if self.closed.load(Ordering::SeqCst) {
            return DocumentHealth::Closed;
        }
        match self.blocked.read().as_ref() {
            Some(reason) => DocumentHealth::Blocked {
                reason: reason.clone(),
            },
            None => DocumentHealth::Healthy,
        }
    }

    fn check_usable(&self) -> Result<(), SyncError> {
        match self.health() {
            DocumentHealth::Healthy => Ok(()),
            DocumentHealth::Blocked { reason } => {
                Err(SyncError::DecryptionFailed(format!("{}: {}", self.id, reason)))
            }
            DocumentHealth::Closed => Err(SyncError::DocumentClosed(self.id.to_string())),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn view_json(&self) -> Result<serde_json::Value, SyncError> {
        self.check_usable()?;
        let doc = self.doc.lock();
        json::to_json(&*doc, &ROOT)
    }

    pub(crate) fn heads(&self) -> Vec<ChangeHash> {
        self.doc.lock().get_heads()
    }

    pub(crate) fn save(&self) -> Result<Vec<u8>, SyncError> {
        self.check_usable()?;
        Ok(self.doc.lock().save())
    }

    /// Apply a local change; visible in the view before any I/O happens.
    pub(crate) async fn change<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<R, SyncError> + Send,
        R: Send,
    {
        self.check_usable()?;
        let (result, delta) = {
            let mut doc = self.doc.lock();
            let before = doc.get_heads();
            match f(&mut *doc) {
                Ok(result) => {
                    doc.commit();
                    let delta = doc.save_after(&before);
                    (result, delta)
                }
                Err(e) => {
                    doc.rollback();
                    return Err(e);
                }
            }
        };
        if delta.is_empty() {
            return Ok(result);
        }

        debug!(doc_id = %self.id, bytes = delta.len(), "Local change");
        self.emit(SyncEvent::DocumentChanged {
            doc_id: self.id.clone(),
            origin: ChangeOrigin::Local,
        });
        self.persist_fast(Some(&delta)).await;
        if let Err(e) = self.router.send_ops(&self.id, &delta) {
            warn!(doc_id = %self.id, error = %e, "Could not broadcast change");
        }
        self.schedule_slow_flush();
        Ok(result)
    }

    /// Merge operations received from the router. Returns whether the view changed.
    pub(crate) async fn apply_remote(&self, ops: &[u8]) -> Result<bool, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let changed = {
            let mut doc = self.doc.lock();
            let before = doc.get_heads();
            doc.load_incremental(ops)?;
            doc.get_heads() != before
        };
        if changed {
            debug!(doc_id = %self.id, bytes = ops.len(), "Merged remote ops");
            self.emit(SyncEvent::DocumentChanged {
                doc_id: self.id.clone(),
                origin: ChangeOrigin::Remote,
            });
            self.persist_fast(Some(ops)).await;
            self.schedule_slow_flush();
        }
        Ok(changed)
    }

    /// Join the router for this document and offer the current state, once.
    pub(crate) fn announce(&self) {
        if self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.doc.lock().save();
        if let Err(e) = self
            .router
            .join(&self.id)
            .and_then(|()| self.router.send_ops(&self.id, &state))
        {
            warn!(doc_id = %self.id, error = %e, "Could not register document with router");
        }
    }

    /// Send the full state to the other members (answer to their `Join`).
    pub(crate) fn send_full_state(&self) {
        let state = self.doc.lock().save();
        if let Err(e) = self.router.send_ops(&self.id, &state) {
            warn!(doc_id = %self.id, error = %e, "Could not answer join");
        }
    }

    fn schedule_slow_flush(&self) {
        self.slow_dirty.store(true, Ordering::SeqCst);
        self.flush_signal.notify_one();
    }

    async fn persist_fast(&self, delta: Option<&[u8]>) {
        let mut state = self.fast_state.lock().await;
        let due = state.dirty || state.chunks.len() + 1 >= self.settings.compaction_threshold;
        match delta {
            Some(delta) if !due => self.write_fast_chunk(&mut state, delta).await,
            _ => self.compact_fast(&mut state).await,
        }
    }

    async fn write_fast_chunk(&self, state: &mut FastState, delta: &[u8]) {
        let key = chunk_key(delta);
        match self.fast.put(&key, delta).await {
            Ok(()) => {
                state.chunks.push(key);
                self.emit(SyncEvent::Persisted {
                    doc_id: self.id.clone(),
                    tier: StorageTier::Fast,
                });
            }
            Err(e) => self.fast_failed(state, e),
        }
    }

    async fn compact_fast(&self, state: &mut FastState) {
        let (bytes, key) = {
            let mut doc = self.doc.lock();
            let heads = doc.get_heads();
            (doc.save(), snapshot_key(&heads))
        };
        if let Err(e) = self.fast.put(&key, &bytes).await {
            self.fast_failed(state, e);
            return;
        }

        state.dirty = false;
        let stale: Vec<StorageKey> = state
            .chunks
            .drain(..)
            .chain(state.snapshots.drain(..))
            .filter(|k| *k != key)
            .collect();
        state.snapshots.push(key);
        for old in stale {
            if let Err(e) = self.fast.delete(&old).await {
                debug!(doc_id = %self.id, key = %old, error = %e, "Stale fast-tier record kept");
                state.chunks.push(old);
            }
        }
        debug!(doc_id = %self.id, bytes = bytes.len(), "Fast tier compacted");
        self.emit(SyncEvent::Persisted {
            doc_id: self.id.clone(),
            tier: StorageTier::Fast,
        });
    }

    fn fast_failed(&self, state: &mut FastState, e: SyncError) {
        state.dirty = true;
        warn!(doc_id = %self.id, tier = "fast", error = %e, "Fast-tier write failed, retrying on next change");
        self.emit(SyncEvent::PersistFailed {
            doc_id: self.id.clone(),
            tier: StorageTier::Fast,
            message: e.to_string(),
            will_retry: true,
        });
    }

    /// Merge slow-tier records not yet contained in the document.
    async fn merge_slow(&self) -> Result<(), SyncError> {
        let mut state = self.slow_state.lock().await;
        let mut changed = false;
        for key in self.slow.list_keys(&StorageKey::root()).await? {
            if state.known.contains(&key) || state.unreadable.contains(&key) {
                continue;
            }
            let Some(bytes) = self.slow.get(&key).await? else {
                continue;
            };
            let merged = {
                let mut doc = self.doc.lock();
                let before = doc.get_heads();
                doc.load_incremental(&bytes).map(|_| doc.get_heads() != before)
            };
            match merged {
                Ok(c) => {
                    changed |= c;
                    state.known.insert(key);
                }
                Err(e) => {
                    warn!(doc_id = %self.id, key = %key, error = %e, "Skipping unparsable slow-tier record");
                    state.unreadable.insert(key);
                }
            }
        }
        state.merged = true;
        drop(state);

        if changed {
            info!(doc_id = %self.id, "Merged newer state from slow tier");
            self.emit(SyncEvent::DocumentChanged {
                doc_id: self.id.clone(),
                origin: ChangeOrigin::Storage,
            });
            self.persist_fast(None).await;
            self.send_full_state();
        }
        Ok(())
    }

    /// Write a snapshot to the slow tier and drop records it supersedes.
    async fn flush_slow(&self) -> Result<(), SyncError> {
        let mut state = self.slow_state.lock().await;
        let (bytes, key) = {
            let mut doc = self.doc.lock();
            let heads = doc.get_heads();
            (doc.save(), snapshot_key(&heads))
        };
        if state.known.len() == 1 && state.known.contains(&key) {
            return Ok(());
        }

        self.slow.put(&key, &bytes).await?;
        let stale: Vec<StorageKey> = state.known.iter().filter(|k| **k != key).cloned().collect();
        state.known.insert(key);
        for old in stale {
            match self.slow.delete(&old).await {
                Ok(()) => {
                    state.known.remove(&old);
                }
                Err(e) => debug!(doc_id = %self.id, key = %old, error = %e, "Stale slow-tier record kept"),
            }
        }
        debug!(doc_id = %self.id, bytes = bytes.len(), "Slow tier flushed");
        self.emit(SyncEvent::Persisted {
            doc_id: self.id.clone(),
            tier: StorageTier::Slow,
        });
        Ok(())
    }

    /// One merge-then-flush pass over the slow tier.
    pub(crate) async fn sync_slow(&self) -> Result<(), SyncError> {
        let _pass = self.sync_lock.lock().await;
        let blocked = self.blocked.read().clone();
        if let Some(reason) = blocked {
            return Err(SyncError::DecryptionFailed(format!("{}: {}", self.id, reason)));
        }
        let merged = self.slow_state.lock().await.merged;
        if !merged {
            self.merge_slow().await?;
        }
        if self.slow_dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.flush_slow().await {
                self.slow_dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    fn block(&self, reason: String) {
        error!(doc_id = %self.id, reason = %reason, "Slow tier blocked; document unusable until resolved");
        *self.blocked.write() = Some(reason.clone());
        self.emit(SyncEvent::SlowTierBlocked {
            doc_id: self.id.clone(),
            reason,
        });
    }

    async fn has_slow_work(&self) -> bool {
        !self.slow_state.lock().await.merged || self.slow_dirty.load(Ordering::SeqCst)
    }

    /// Sleep for `delay` unless the document is closed first.
    async fn pause(&self, delay: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.close_signal.notified() => {}
        }
    }

    async fn run_flusher(&self) {
        let mut attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let blocked = self.blocked.read().is_some();
            if blocked || !self.has_slow_work().await {
                tokio::select! {
                    _ = self.flush_signal.notified() => {}
                    _ = self.close_signal.notified() => {}
                }
                continue;
            }
            if attempt == 0 && !self.settings.flush_debounce.is_zero() {
                self.pause(self.settings.flush_debounce).await;
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
            }

            match self.sync_slow().await {
                Ok(()) => attempt = 0,
                Err(SyncError::DecryptionFailed(reason)) => self.block(reason),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.settings.retry.delay_for(attempt);
                    warn!(doc_id = %self.id, tier = "slow", attempt, ?delay, error = %e, "Slow-tier sync failed, backing off");
                    self.emit(SyncEvent::PersistFailed {
                        doc_id: self.id.clone(),
                        tier: StorageTier::Slow,
                        message: e.to_string(),
                        will_retry: true,
                    });
                    self.pause(delay).await;
                }
            }
        }
        debug!(doc_id = %self.id, "Slow-tier flusher stopped");
    }

    pub(crate) fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let replica = self.clone();
        tokio::spawn(async move { replica.run_flusher().await })
    }

    /// Final best-effort slow flush, then stop background work and leave the router.
    pub(crate) async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let blocked = self.blocked.read().is_some();
        if !blocked {
            if let Err(e) = self.sync_slow().await {
                warn!(doc_id = %self.id, error = %e, "Final slow-tier flush failed");
            }
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.notify_one();
        if let Err(e) = self.router.leave(&self.id) {
            debug!(doc_id = %self.id, error = %e, "Leave not delivered");
        }
        info!(doc_id = %self.id, "Document closed");
        self.emit(SyncEvent::DocumentClosed {
            doc_id: self.id.clone(),
        });
    }
}
