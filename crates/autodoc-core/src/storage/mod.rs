//! Byte storage adapters and the wrappers that compose them.
//!
//! Every tier is a [`StorageAdapter`]: keyed byte storage with prefix scans.
//! Adapters are stacked to build a document's storage:
//!
//! ```text
//! fast tier:  NamespacedStorage(doc_id) ── RedbStorage / MemoryStorage
//! slow tier:  EncryptedStorage(key) ── NamespacedStorage(doc_id) ── RemoteStore::scoped(owner)
//! ```
//!
//! Namespaces stay visible to the backing store for indexing; only values
//! are opaque.

mod encrypted;
mod local;
mod memory;
mod namespaced;
mod remote;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub use encrypted::EncryptedStorage;
pub use local::RedbStorage;
pub use memory::MemoryStorage;
pub use namespaced::NamespacedStorage;
pub use remote::{MemoryRemote, RemoteStore};

/// Hierarchical storage key made of string segments.
///
/// Segment boundaries are preserved by [`StorageKey::encode`], so a key
/// prefix always means a whole-segment prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    /// Build a key from segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty key; as a prefix it matches everything
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Key segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a segment
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Prepend a segment
    pub fn prepend(&self, segment: impl Into<String>) -> Self {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.push(segment.into());
        segments.extend(self.0.iter().cloned());
        Self(segments)
    }

    /// Whether `prefix` names the leading segments of this key
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Remove a leading segment prefix, if present
    pub fn strip_prefix(&self, prefix: &StorageKey) -> Option<StorageKey> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| StorageKey(rest.to_vec()))
    }

    /// Prefix-free string encoding: `<byte len>:<segment>` per segment.
    ///
    /// `a.encode()` is a string prefix of `b.encode()` exactly when `a` is a
    /// segment prefix of `b`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for seg in &self.0 {
            out.push_str(&seg.len().to_string());
            out.push(':');
            out.push_str(seg);
        }
        out
    }

    /// Inverse of [`StorageKey::encode`].
    pub fn decode(s: &str) -> Result<Self, SyncError> {
        let mut segments = Vec::new();
        let mut rest = s;
        while !rest.is_empty() {
            let (len, tail) = rest
                .split_once(':')
                .ok_or_else(|| SyncError::Storage(format!("malformed storage key {s:?}")))?;
            let len: usize = len
                .parse()
                .map_err(|_| SyncError::Storage(format!("malformed storage key {s:?}")))?;
            let seg = tail
                .get(..len)
                .ok_or_else(|| SyncError::Storage(format!("truncated storage key {s:?}")))?;
            segments.push(seg.to_string());
            rest = &tail[len..];
        }
        Ok(Self(segments))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Keyed byte storage with prefix listing.
///
/// `get` distinguishes an absent key (`Ok(None)`) from an unreadable one
/// (`Err`), which matters for encrypted tiers.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read the value at `key`
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, SyncError>;

    /// Write `value` at `key`, replacing any previous value
    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), SyncError>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &StorageKey) -> Result<(), SyncError>;

    /// All keys that start with `prefix`, in key order
    async fn list_keys(&self, prefix: &StorageKey) -> Result<Vec<StorageKey>, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = StorageKey::new(["catalog/did:plc:alice", "snapshot", "ab:cd"]);
        assert_eq!(StorageKey::decode(&key.encode()).unwrap(), key);
        assert_eq!(StorageKey::decode("").unwrap(), StorageKey::root());
    }

    #[test]
    fn test_encoding_is_prefix_free() {
        // Naive joining would make ["a/b"] + "x" collide with ["a", "b/x"].
        let k1 = StorageKey::new(["a/b", "x"]);
        let k2 = StorageKey::new(["a", "b/x"]);
        assert_ne!(k1.encode(), k2.encode());

        let ns_a = StorageKey::new(["a"]);
        assert!(!k1.encode().starts_with(&ns_a.encode()));
        assert!(k2.encode().starts_with(&ns_a.encode()));
    }

    #[test]
    fn test_prefix_helpers() {
        let key = StorageKey::new(["ns", "snapshot", "h1"]);
        let prefix = StorageKey::new(["ns"]);
        assert!(key.starts_with(&prefix));
        assert_eq!(
            key.strip_prefix(&prefix).unwrap(),
            StorageKey::new(["snapshot", "h1"])
        );
        assert_eq!(StorageKey::new(["snapshot"]).prepend("ns").child("h1"), key);
        assert!(key.strip_prefix(&StorageKey::new(["other"])).is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(StorageKey::decode("abc").is_err());
        assert!(StorageKey::decode("5:ab").is_err());
        assert!(StorageKey::decode("x:ab").is_err());
    }

    #[test]
    fn test_unicode_segments() {
        let key = StorageKey::new(["did:plc:ünï", "😀"]);
        assert_eq!(StorageKey::decode(&key.encode()).unwrap(), key);
    }
}
