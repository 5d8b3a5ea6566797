//! The device's identity key lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::keys::IdentityKeyPair;
use crate::storage::KeyStorage;
use crate::types::{Result, SealChatError, KEY_SIZE};

/// Result of [`KeyVault::ensure_identity`].
#[derive(Debug, Clone)]
pub struct EnsuredIdentity {
    pub key_pair: IdentityKeyPair,
    pub public_key: String,
    /// True when this call generated the key pair.
    pub newly_generated: bool,
}

/// Owns the local identity key pair and its persistence.
pub struct KeyVault<S: KeyStorage> {
    user_id: String,
    storage: S,
    current: RwLock<Option<IdentityKeyPair>>,
    awaiting_recovery: AtomicBool,
}

impl<S: KeyStorage> KeyVault<S> {
    pub fn new(user_id: impl Into<String>, storage: S) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
            current: RwLock::new(None),
            awaiting_recovery: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Load the stored identity, generating and persisting one on first use.
    ///
    /// Callers publish the returned public key afterwards; publishing is
    /// idempotent, so doing it on every call heals a previously failed upload.
    pub async fn ensure_identity(&self) -> Result<EnsuredIdentity> {
        let mut current = self.current.write().await;

        if let Some(key_pair) = current.as_ref() {
            return Ok(EnsuredIdentity {
                public_key: key_pair.export_public_key(),
                key_pair: key_pair.clone(),
                newly_generated: false,
            });
        }

        if let Some(bytes) = self.storage.retrieve(&self.user_id).await? {
            let key_pair = IdentityKeyPair::from_private_bytes(bytes);
            debug!(user = %self.user_id, key = %key_pair.fingerprint(), "Loaded stored identity");
            *current = Some(key_pair.clone());
            self.awaiting_recovery.store(false, Ordering::SeqCst);
            return Ok(EnsuredIdentity {
                public_key: key_pair.export_public_key(),
                key_pair,
                newly_generated: false,
            });
        }

        let key_pair = IdentityKeyPair::generate();
        self.storage
            .store(&key_pair.private_bytes(), &self.user_id)
            .await?;
        info!(user = %self.user_id, key = %key_pair.fingerprint(), "Generated new identity");

        *current = Some(key_pair.clone());
        self.awaiting_recovery.store(false, Ordering::SeqCst);
        Ok(EnsuredIdentity {
            public_key: key_pair.export_public_key(),
            key_pair,
            newly_generated: true,
        })
    }

    /// Whether a private key exists in memory or in storage.
    pub async fn has_identity(&self) -> Result<bool> {
        if self.current.read().await.is_some() {
            return Ok(true);
        }
        Ok(self.storage.retrieve(&self.user_id).await?.is_some())
    }

    /// The loaded identity, if any. Never touches storage.
    pub async fn current(&self) -> Option<IdentityKeyPair> {
        self.current.read().await.clone()
    }

    /// The loaded identity or `NoIdentity`.
    pub async fn require(&self) -> Result<IdentityKeyPair> {
        self.current().await.ok_or(SealChatError::NoIdentity)
    }

    /// Export of the loaded public key.
    pub async fn export_public_key(&self) -> Result<String> {
        Ok(self.require().await?.export_public_key())
    }

    /// Flag that the identity lives only in a server backup until the PIN
    /// is entered. Cleared once any identity is loaded.
    pub fn set_awaiting_recovery(&self, awaiting: bool) {
        self.awaiting_recovery.store(awaiting, Ordering::SeqCst);
    }

    /// True while no identity is loaded and a backup waits for the PIN.
    pub async fn is_awaiting_recovery(&self) -> bool {
        self.awaiting_recovery.load(Ordering::SeqCst) && self.current.read().await.is_none()
    }

    /// Replace the identity with recovered key material and persist it.
    pub async fn install(&self, private_key: [u8; KEY_SIZE]) -> Result<IdentityKeyPair> {
        let key_pair = IdentityKeyPair::from_private_bytes(private_key);
        let mut current = self.current.write().await;

        if let Some(existing) = current.as_ref() {
            if existing.export_public_key() != key_pair.export_public_key() {
                warn!(
                    user = %self.user_id,
                    old = %existing.fingerprint(),
                    new = %key_pair.fingerprint(),
                    "Replacing local identity with recovered key"
                );
            }
        }

        self.storage.store(&private_key, &self.user_id).await?;
        *current = Some(key_pair.clone());
        self.awaiting_recovery.store(false, Ordering::SeqCst);
        info!(user = %self.user_id, key = %key_pair.fingerprint(), "Installed recovered identity");
        Ok(key_pair)
    }

    /// Forget the identity in memory and in storage.
    pub async fn destroy(&self) -> Result<()> {
        let mut current = self.current.write().await;
        self.storage.delete(&self.user_id).await?;
        if let Some(old) = current.take() {
            warn!(user = %self.user_id, key = %old.fingerprint(), "Destroyed local identity");
        }
        Ok(())
    }
}
