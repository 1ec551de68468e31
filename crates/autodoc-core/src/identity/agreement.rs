//! Symmetric key derivation for encrypted documents
//!
//! ```text
//! dm key   = HKDF-SHA256(X25519(local_scalar, remote_montgomery), "autodoc-dm-key-v1")
//! self key = HKDF-SHA256(local_seed, "autodoc-self-key-v1")
//! ```
//!
//! Ed25519 secrets are mapped to X25519 scalars and Ed25519 public keys to
//! their Montgomery form, so the identity keypair doubles as the agreement
//! keypair. Both parties derive the same dm key.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use super::{KeyPair, PublicKey};
use crate::error::SyncError;

const DM_KEY_INFO: &[u8] = b"autodoc-dm-key-v1";
const SELF_KEY_INFO: &[u8] = b"autodoc-self-key-v1";

/// 32-byte symmetric key for ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short public fingerprint stored next to ciphertext.
    ///
    /// Lets a reader tell "sealed under another key" apart from corruption.
    pub fn key_id(&self) -> [u8; 8] {
        let hash = blake3::derive_key("autodoc-key-id-v1", &self.0);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash[..8]);
        id
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey(id={})", hex::encode(self.key_id()))
    }
}

fn expand(ikm: &[u8], info: &[u8]) -> Result<SymmetricKey, SyncError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| SyncError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(SymmetricKey(okm))
}

/// Derive the key shared between `local` and the owner of `remote`.
///
/// Deterministic and symmetric: `shared_secret(a, B) == shared_secret(b, A)`.
///
/// # Errors
///
/// Returns `SyncError::Crypto` if the remote key is a low-order point (the
/// agreement would not depend on the local secret).
pub fn shared_secret(local: &KeyPair, remote: &PublicKey) -> Result<SymmetricKey, SyncError> {
    let secret = StaticSecret::from(local.x25519_scalar_bytes());
    let their_public = X25519PublicKey::from(remote.x25519_bytes());
    let shared = secret.diffie_hellman(&their_public);
    if !shared.was_contributory() {
        return Err(SyncError::Crypto(
            "key agreement produced a non-contributory secret".to_string(),
        ));
    }
    expand(shared.as_bytes(), DM_KEY_INFO)
}

/// Derive the key the local identity uses for its own private documents.
pub fn self_key(local: &KeyPair) -> Result<SymmetricKey, SyncError> {
    expand(&local.to_seed(), SELF_KEY_INFO)
}
