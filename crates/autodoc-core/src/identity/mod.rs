//! Identity module for Autodoc
//!
//! An [`Identity`] is an opaque, globally unique user identifier (typically a
//! DID string such as `did:plc:alice`). Each identity owns an Ed25519
//! [`KeyPair`]; the private half never leaves the process, the public half is
//! discoverable through a [`PublicKeyResolver`].
//!
//! Two-party documents are encrypted with a key agreed between the two
//! keypairs, see [`agreement`].
//!
//! ## Example
//!
//! ```rust
//! use autodoc_core::identity::{shared_secret, Identity, KeyPair};
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! let ab = shared_secret(&alice, &bob.public_key()).unwrap();
//! let ba = shared_secret(&bob, &alice.public_key()).unwrap();
//! assert_eq!(ab, ba);
//!
//! let id = Identity::parse("did:plc:alice").unwrap();
//! assert_eq!(id.as_str(), "did:plc:alice");
//! ```

pub mod agreement;
mod keypair;
mod resolver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub use agreement::{self_key, shared_secret, SymmetricKey};
pub use keypair::{KeyPair, PublicKey};
pub use resolver::{KeyDirectory, PublicKeyResolver};

/// Opaque user identifier, immutable for the lifetime of a session.
///
/// Identities are ordered lexicographically; that order canonicalises
/// two-party document ids.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Parse and validate an identity string.
    ///
    /// Rejects empty strings, whitespace and `/` (the document id separator).
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        if s.is_empty() {
            return Err(SyncError::InvalidIdentity("identity cannot be empty".into()));
        }
        if s.contains('/') {
            return Err(SyncError::InvalidIdentity(format!(
                "identity must not contain '/': {s}"
            )));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(SyncError::InvalidIdentity(format!(
                "identity must not contain whitespace: {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `:`-separated component, used as a readable instance name.
    ///
    /// `did:plc:alice` becomes `alice`.
    pub fn short(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}
