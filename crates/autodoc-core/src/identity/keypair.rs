//! Ed25519 identity keypair
//!
//! The same curve backs signatures and, via its Montgomery form, the X25519
//! key agreement used for direct-message encryption.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

/// Private identity key. Owned exclusively by its holder and never transmitted.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Recreate a keypair from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a keypair from a seed slice, checking its length.
    pub fn from_seed_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::Crypto(format!("seed must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    /// The 32-byte secret seed.
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Unclamped Curve25519 scalar for X25519 agreement.
    pub(crate) fn x25519_scalar_bytes(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key, resolvable by identity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying: VerifyingKey,
}

impl PublicKey {
    /// Parse a public key from its 32-byte compressed form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            SyncError::Crypto(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        let verifying = VerifyingKey::from_bytes(&arr)
            .map_err(|e| SyncError::Crypto(format!("invalid public key: {e}")))?;
        Ok(Self { verifying })
    }

    /// Compressed 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse from lowercase or uppercase hex.
    pub fn from_hex(s: &str) -> Result<Self, SyncError> {
        let bytes = hex::decode(s).map_err(|e| SyncError::Crypto(format!("invalid hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Verify a signature made by the matching keypair.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }

    /// Montgomery-form point for X25519 agreement.
    pub(crate) fn x25519_bytes(&self) -> [u8; 32] {
        self.verifying.to_montgomery().to_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
