//! Identity key pairs and X25519 primitives.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::types::{Result, SealChatError, KEY_SIZE};

/// A device's long-lived X25519 identity.
#[derive(Clone)]
pub struct IdentityKeyPair {
    private_key: StaticSecret,
    public_key: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Rebuild a key pair from raw private key bytes.
    pub fn from_private_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let private_key = StaticSecret::from(bytes);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Rebuild a key pair from a byte slice, checking its length.
    pub fn from_private_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            SealChatError::KeyStorage(format!(
                "private key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self::from_private_bytes(array))
    }

    /// Raw private key bytes, wiped when dropped.
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.private_key.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Transport encoding of the public key.
    pub fn export_public_key(&self) -> String {
        export_public_key(&self.public_key)
    }

    /// Short fingerprint of the public key for logs.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.export_public_key())
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(peer)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.export_public_key())
            .finish_non_exhaustive()
    }
}

/// Encode a public key as standard base64 of the 32-byte point.
pub fn export_public_key(public_key: &PublicKey) -> String {
    STANDARD.encode(public_key.as_bytes())
}

/// Parse a public key previously produced by [`export_public_key`].
pub fn parse_public_key(encoded: &str) -> Result<PublicKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SealChatError::InvalidPublicKey(format!("not base64: {}", e)))?;
    let array: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        SealChatError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(array))
}

/// First 8 bytes of SHA-256 over an exported key, hex encoded.
pub fn fingerprint(exported_public_key: &str) -> String {
    let digest = Sha256::digest(exported_public_key.as_bytes());
    hex::encode(&digest[..8])
}
