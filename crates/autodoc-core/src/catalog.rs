//! Catalog and channel schemas
//!
//! The catalog (`catalog/<owner>`) lists the owner's conversations under
//! `dms`, keyed by counterpart identity. A channel (`dm/<a>/<b>`) holds an
//! append-only list of messages.
//!
//! Initial bytes are built with a fixed actor and timestamp, so every peer
//! that creates one of these documents from scratch starts from the same
//! change and later merges cleanly with the others.

use std::collections::BTreeMap;

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ObjType, ReadDoc, ROOT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::doc::json::{ensure_object, push_json};
use crate::doc::Document;
use crate::error::SyncError;
use crate::identity::Identity;

const SCHEMA_ACTOR: [u8; 16] = *b"autodoc-schema-0";

/// View of a `catalog/<owner>` document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Conversations by counterpart identity
    #[serde(default)]
    pub dms: BTreeMap<String, ConversationMeta>,
}

/// Catalog entry for one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    /// Milliseconds since the epoch when the entry was added
    #[serde(default)]
    pub added_at: Option<i64>,
    /// Display name chosen by the owner
    #[serde(default)]
    pub name: Option<String>,
}

/// View of a `dm/<a>/<b>` document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Messages in insertion order
    #[serde(default)]
    pub messages: Vec<ChannelMessage>,
}

/// One message in a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// ULID, sortable by creation time
    pub id: String,
    /// Sender identity
    pub author: String,
    /// Message text
    pub body: String,
    /// Milliseconds since the epoch
    pub sent_at: i64,
}

impl Catalog {
    /// Counterpart identities listed in the catalog; malformed keys are skipped.
    pub fn identities(&self) -> Vec<Identity> {
        self.dms
            .keys()
            .filter_map(|key| Identity::parse(key).ok())
            .collect()
    }
}

fn schema_bytes(root_key: &str, kind: ObjType) -> Vec<u8> {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(SCHEMA_ACTOR.as_slice()));
    // Writing a fresh key into an empty document cannot fail.
    if doc.put_object(&ROOT, root_key, kind).is_ok() {
        doc.commit_with(CommitOptions::default().with_time(0));
    }
    doc.save()
}

/// Initial bytes for a catalog: an empty `dms` map
pub fn catalog_init() -> Vec<u8> {
    schema_bytes("dms", ObjType::Map)
}

/// Initial bytes for a channel: an empty `messages` list
pub fn channel_init() -> Vec<u8> {
    schema_bytes("messages", ObjType::List)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Add `other` to the catalog, or rename an existing entry.
///
/// # Errors
///
/// `InvalidIdentity` when `other` owns the catalog.
pub async fn add_conversation(
    catalog: &Document<Catalog>,
    other: &Identity,
    name: Option<&str>,
) -> Result<(), SyncError> {
    if catalog.id().participants().first() == Some(other) {
        return Err(SyncError::InvalidIdentity(format!(
            "{other} cannot start a conversation with itself"
        )));
    }
    let key = other.to_string();
    let name = name.map(str::to_string);
    catalog
        .change(move |doc| {
            let dms = ensure_object(doc, &ROOT, "dms", ObjType::Map)?;
            let entry = ensure_object(doc, &dms, &key, ObjType::Map)?;
            if doc.get(&entry, "added_at")?.is_none() {
                doc.put(&entry, "added_at", now_millis())?;
            }
            if let Some(name) = name {
                doc.put(&entry, "name", name)?;
            }
            Ok(())
        })
        .await?;
    debug!(catalog = %catalog.id(), other = %other, "Conversation added");
    Ok(())
}

/// Remove `other` from the catalog. Returns whether it was listed.
///
/// An already open dm document stays open.
pub async fn remove_conversation(
    catalog: &Document<Catalog>,
    other: &Identity,
) -> Result<bool, SyncError> {
    let key = other.to_string();
    catalog
        .change(move |doc| {
            let Some((_, dms)) = doc.get(&ROOT, "dms")? else {
                return Ok(false);
            };
            if doc.get(&dms, key.as_str())?.is_none() {
                return Ok(false);
            }
            doc.delete(&dms, key.as_str())?;
            Ok(true)
        })
        .await
}

/// Append a message from `author`. Returns the message.
pub async fn post_message(
    channel: &Document<Channel>,
    author: &Identity,
    body: &str,
) -> Result<ChannelMessage, SyncError> {
    let message = ChannelMessage {
        id: ulid::Ulid::new().to_string(),
        author: author.to_string(),
        body: body.to_string(),
        sent_at: now_millis(),
    };
    let value =
        serde_json::to_value(&message).map_err(|e| SyncError::Serialization(e.to_string()))?;
    channel
        .change(move |doc| {
            let messages = ensure_object(doc, &ROOT, "messages", ObjType::List)?;
            push_json(doc, &messages, &value)
        })
        .await?;
    debug!(channel = %channel.id(), id = %message.id, "Message posted");
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_bytes_are_deterministic() {
        assert_eq!(catalog_init(), catalog_init());
        assert_eq!(channel_init(), channel_init());
        assert_ne!(catalog_init(), channel_init());
    }

    #[test]
    fn test_init_shapes() {
        let catalog = AutoCommit::load(&catalog_init()).unwrap();
        let view: Catalog =
            serde_json::from_value(crate::doc::json::to_json(&catalog, &ROOT).unwrap()).unwrap();
        assert!(view.dms.is_empty());

        let channel = AutoCommit::load(&channel_init()).unwrap();
        let view: Channel =
            serde_json::from_value(crate::doc::json::to_json(&channel, &ROOT).unwrap()).unwrap();
        assert!(view.messages.is_empty());
    }

    #[test]
    fn test_independent_inits_share_history() {
        let mut a = AutoCommit::load(&channel_init()).unwrap();
        let mut b = AutoCommit::load(&channel_init()).unwrap();
        assert_eq!(a.get_heads(), b.get_heads());

        let (_, list_a) = a.get(&ROOT, "messages").unwrap().unwrap();
        a.insert(&list_a, 0, "from a").unwrap();
        let (_, list_b) = b.get(&ROOT, "messages").unwrap().unwrap();
        b.insert(&list_b, 0, "from b").unwrap();

        a.merge(&mut b).unwrap();
        assert_eq!(a.length(&list_a), 2);
    }

    #[test]
    fn test_identities_skip_malformed_keys() {
        let mut catalog = Catalog::default();
        catalog.dms.insert("did:plc:bob".into(), ConversationMeta::default());
        catalog.dms.insert("not/valid".into(), ConversationMeta::default());
        assert_eq!(
            catalog.identities(),
            vec![Identity::parse("did:plc:bob").unwrap()]
        );
    }
}
