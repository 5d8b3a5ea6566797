//! Per-peer conversation keys.
//!
//! Each entry remembers which peer key and which local key it was derived
//! from. A lookup with different inputs discards the entry and derives again,
//! so a secret from before a key rotation is never reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{derive_conversation_key, SymmetricKey};
use crate::keys::{fingerprint, parse_public_key, IdentityKeyPair};
use crate::types::Result;

/// A cached conversation key.
#[derive(Clone)]
pub struct SharedSecretEntry {
    pub peer_user_id: String,
    pub symmetric_key: Zeroizing<SymmetricKey>,
    /// Peer public key export the secret was derived from.
    pub derived_from_public_key: String,
    /// Local public key export the secret was derived with.
    pub local_public_key: String,
}

impl SharedSecretEntry {
    fn matches(&self, local_public_key: &str, peer_public_key: &str) -> bool {
        self.derived_from_public_key == peer_public_key && self.local_public_key == local_public_key
    }
}

impl fmt::Debug for SharedSecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretEntry")
            .field("peer_user_id", &self.peer_user_id)
            .field("symmetric_key", &"<redacted>")
            .field("derived_from_public_key", &self.derived_from_public_key)
            .field("local_public_key", &self.local_public_key)
            .finish()
    }
}

/// Cache of conversation keys keyed by peer user id.
#[derive(Default)]
pub struct SharedSecretCache {
    entries: Arc<RwLock<HashMap<String, SharedSecretEntry>>>,
}

impl SharedSecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation key for `peer_user_id`, derived on first use.
    ///
    /// A cached entry is reused only if both the peer key and the local key
    /// are the ones it was derived from.
    pub async fn derive_shared_key(
        &self,
        local: &IdentityKeyPair,
        peer_public_key: &str,
        peer_user_id: &str,
    ) -> Result<Zeroizing<SymmetricKey>> {
        let local_public_key = local.export_public_key();

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(peer_user_id) {
                if entry.matches(&local_public_key, peer_public_key) {
                    return Ok(entry.symmetric_key.clone());
                }
            }
        }

        let peer_key = parse_public_key(peer_public_key)?;
        let symmetric_key = derive_conversation_key(local, &peer_key)?;

        let mut entries = self.entries.write().await;
        if let Some(stale) = entries.get(peer_user_id) {
            info!(
                peer = %peer_user_id,
                old = %fingerprint(&stale.derived_from_public_key),
                new = %fingerprint(peer_public_key),
                "Discarding conversation key derived from an old key"
            );
        } else {
            debug!(
                peer = %peer_user_id,
                key = %fingerprint(peer_public_key),
                "Derived conversation key"
            );
        }
        entries.insert(
            peer_user_id.to_string(),
            SharedSecretEntry {
                peer_user_id: peer_user_id.to_string(),
                symmetric_key: symmetric_key.clone(),
                derived_from_public_key: peer_public_key.to_string(),
                local_public_key,
            },
        );
        Ok(symmetric_key)
    }

    /// Drop the entry for `peer_user_id` if it was derived from a key other
    /// than `current_public_key`. Returns true if an entry was dropped.
    pub async fn invalidate_if_stale(&self, peer_user_id: &str, current_public_key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let stale = entries
            .get(peer_user_id)
            .is_some_and(|e| e.derived_from_public_key != current_public_key);
        if stale {
            entries.remove(peer_user_id);
            info!(peer = %peer_user_id, "Peer key rotated; conversation key invalidated");
        }
        stale
    }

    pub async fn invalidate(&self, peer_user_id: &str) -> bool {
        self.entries.write().await.remove(peer_user_id).is_some()
    }

    /// Forget every conversation key, e.g. after the local identity changed.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn entry(&self, peer_user_id: &str) -> Option<SharedSecretEntry> {
        self.entries.read().await.get(peer_user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
