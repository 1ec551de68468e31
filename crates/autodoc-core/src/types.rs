//! Core types for Autodoc

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::identity::Identity;

/// Kind segment of a [`DocumentId`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentKind {
    /// A user's conversation catalog (`catalog/<owner>`)
    Catalog,
    /// A two-party direct-message channel (`dm/<a>/<b>`, sorted)
    Dm,
    /// Any other document kind
    Other(String),
}

impl DocumentKind {
    /// The kind segment as written in ids
    pub fn as_str(&self) -> &str {
        match self {
            DocumentKind::Catalog => "catalog",
            DocumentKind::Dm => "dm",
            DocumentKind::Other(s) => s,
        }
    }

    fn from_segment(s: &str) -> Self {
        match s {
            "catalog" => DocumentKind::Catalog,
            "dm" => DocumentKind::Dm,
            other => DocumentKind::Other(other.to_string()),
        }
    }
}

/// Canonical identifier of a replicated document.
///
/// Written as `<kind>/<segment>/...`. For two-party kinds the identity
/// segments are sorted, so both parties construct the same id.
///
/// # Example
///
/// ```
/// use autodoc_core::{DocumentId, Identity};
///
/// let alice = Identity::parse("did:plc:alice").unwrap();
/// let bob = Identity::parse("did:plc:bob").unwrap();
///
/// assert_eq!(DocumentId::dm(&bob, &alice), DocumentId::dm(&alice, &bob));
/// assert_eq!(DocumentId::dm(&bob, &alice).to_string(), "dm/did:plc:alice/did:plc:bob");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId {
    kind: DocumentKind,
    segments: Vec<String>,
}

impl DocumentId {
    /// The catalog document owned by `owner`
    pub fn catalog(owner: &Identity) -> Self {
        Self {
            kind: DocumentKind::Catalog,
            segments: vec![owner.to_string()],
        }
    }

    /// The direct-message document between two identities (order-independent)
    pub fn dm(a: &Identity, b: &Identity) -> Self {
        let mut segments = vec![a.to_string(), b.to_string()];
        segments.sort();
        Self {
            kind: DocumentKind::Dm,
            segments,
        }
    }

    /// A document of a custom kind
    pub fn other(kind: &str, segments: &[&str]) -> Result<Self, SyncError> {
        let mut raw = String::from(kind);
        for s in segments {
            raw.push('/');
            raw.push_str(s);
        }
        Self::parse(&raw)
    }

    /// Parse an id string, canonicalising two-party segment order.
    ///
    /// Structural checks only: a `dm` id naming a single participant parses,
    /// and is rejected later when storage for it is selected.
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        let mut parts = s.split('/');
        let kind_str = parts.next().unwrap_or_default();
        if kind_str.is_empty() {
            return Err(SyncError::InvalidDocumentId(format!("missing kind: {s:?}")));
        }
        let kind = DocumentKind::from_segment(kind_str);
        let mut segments: Vec<String> = parts.map(str::to_string).collect();

        if segments.is_empty() {
            return Err(SyncError::InvalidDocumentId(format!(
                "{s:?} has no segments after the kind"
            )));
        }
        if segments.iter().any(String::is_empty) {
            return Err(SyncError::InvalidDocumentId(format!("empty segment in {s:?}")));
        }

        match kind {
            DocumentKind::Catalog => {
                if segments.len() != 1 {
                    return Err(SyncError::InvalidDocumentId(format!(
                        "catalog id must name exactly one owner: {s:?}"
                    )));
                }
                Identity::parse(&segments[0])
                    .map_err(|e| SyncError::InvalidDocumentId(format!("{s:?}: {e}")))?;
            }
            DocumentKind::Dm => {
                if segments.len() > 2 {
                    return Err(SyncError::InvalidDocumentId(format!(
                        "dm id must name at most two participants: {s:?}"
                    )));
                }
                for seg in &segments {
                    Identity::parse(seg)
                        .map_err(|e| SyncError::InvalidDocumentId(format!("{s:?}: {e}")))?;
                }
                segments.sort();
            }
            DocumentKind::Other(_) => {}
        }

        Ok(Self { kind, segments })
    }

    /// The kind of this document
    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    /// Segments after the kind
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Identities named by a catalog or dm id.
    ///
    /// Empty for other kinds, whose segments are not identities.
    pub fn participants(&self) -> Vec<Identity> {
        match self.kind {
            DocumentKind::Catalog | DocumentKind::Dm => self
                .segments
                .iter()
                .filter_map(|s| Identity::parse(s).ok())
                .collect(),
            DocumentKind::Other(_) => Vec::new(),
        }
    }

    /// The other participant of a dm id, seen from `local`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidDocumentId` if this is not a dm id, if
    /// `local` is not a participant, or if no participant differs from `local`.
    pub fn counterpart(&self, local: &Identity) -> Result<Identity, SyncError> {
        if self.kind != DocumentKind::Dm {
            return Err(SyncError::InvalidDocumentId(format!("{self} is not a dm")));
        }
        let participants = self.participants();
        if !participants.contains(local) {
            return Err(SyncError::InvalidDocumentId(format!(
                "{local} is not a participant of {self}"
            )));
        }
        participants
            .into_iter()
            .find(|p| p != local)
            .ok_or_else(|| {
                SyncError::InvalidDocumentId(format!("{self} has no counterpart besides {local}"))
            })
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl FromStr for DocumentId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_dm_is_sorted() {
        let a = id("did:plc:alice");
        let b = id("did:plc:bob");
        assert_eq!(DocumentId::dm(&a, &b), DocumentId::dm(&b, &a));
        assert_eq!(DocumentId::dm(&b, &a).to_string(), "dm/did:plc:alice/did:plc:bob");
    }

    #[test]
    fn test_catalog_display() {
        let a = id("did:plc:alice");
        assert_eq!(DocumentId::catalog(&a).to_string(), "catalog/did:plc:alice");
    }

    #[test]
    fn test_parse_canonicalises_dm() {
        let parsed = DocumentId::parse("dm/did:plc:bob/did:plc:alice").unwrap();
        assert_eq!(parsed.to_string(), "dm/did:plc:alice/did:plc:bob");
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["catalog/did:plc:alice", "dm/did:plc:a/did:plc:b", "space/general/topic"] {
            assert_eq!(DocumentId::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in ["", "dm", "dm/", "/x", "catalog/a/b", "dm/a//b", "dm/a/b/c", "catalog/a b"] {
            assert!(
                matches!(DocumentId::parse(s), Err(SyncError::InvalidDocumentId(_))),
                "expected {s:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_single_participant_dm_parses() {
        let parsed = DocumentId::parse("dm/did:plc:alice").unwrap();
        assert_eq!(parsed.participants(), vec![id("did:plc:alice")]);
    }

    #[test]
    fn test_counterpart() {
        let a = id("did:plc:alice");
        let b = id("did:plc:bob");
        let dm = DocumentId::dm(&a, &b);
        assert_eq!(dm.counterpart(&a).unwrap(), b);
        assert_eq!(dm.counterpart(&b).unwrap(), a);
    }

    #[test]
    fn test_counterpart_missing() {
        let a = id("did:plc:alice");
        let only_self = DocumentId::parse("dm/did:plc:alice").unwrap();
        assert!(matches!(
            only_self.counterpart(&a),
            Err(SyncError::InvalidDocumentId(_))
        ));

        let self_with_self = DocumentId::dm(&a, &a);
        assert!(self_with_self.counterpart(&a).is_err());

        let strangers = DocumentId::dm(&id("did:plc:x"), &id("did:plc:y"));
        assert!(strangers.counterpart(&a).is_err());
    }

    #[test]
    fn test_other_kind() {
        let doc = DocumentId::other("space", &["lobby"]).unwrap();
        assert_eq!(doc.kind(), &DocumentKind::Other("space".into()));
        assert!(doc.participants().is_empty());
        assert!(doc.counterpart(&id("did:plc:alice")).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let doc = DocumentId::parse("dm/did:plc:b/did:plc:a").unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, "\"dm/did:plc:a/did:plc:b\"");
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
