//! Peer public key lookup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::api::MessagingApi;
use crate::keys::{fingerprint, parse_public_key};
use crate::storage::{CacheLookup, PublicKeyCache};
use crate::types::Result;

/// Fetches peers' published public keys through a session cache.
///
/// Entries are only replaced through [`PublicKeyDirectory::refresh_stale`],
/// which the sync layer calls before sending and after a decryption failure.
pub struct PublicKeyDirectory<A: MessagingApi> {
    api: Arc<A>,
    cache: PublicKeyCache,
    refresh_interval: Duration,
}

impl<A: MessagingApi> PublicKeyDirectory<A> {
    /// `missing_key_retry` bounds how long a "not published" answer is
    /// trusted; `refresh_interval` throttles rotation refetches per user.
    pub fn new(api: Arc<A>, missing_key_retry: Duration, refresh_interval: Duration) -> Self {
        Self {
            api,
            cache: PublicKeyCache::new(missing_key_retry),
            refresh_interval,
        }
    }

    /// The peer's public key, or `None` if they have not published one.
    pub async fn get_public_key(&self, user_id: &str) -> Result<Option<String>> {
        match self.cache.lookup(user_id).await {
            CacheLookup::Hit(record) => return Ok(Some(record.public_key)),
            CacheLookup::KnownMissing => return Ok(None),
            CacheLookup::Miss => {}
        }

        match self.fetch_validated(user_id).await? {
            Some(public_key) => {
                let record = self.cache.insert(user_id, public_key).await;
                debug!(
                    user = %user_id,
                    key = %fingerprint(&record.public_key),
                    "Fetched public key"
                );
                Ok(Some(record.public_key))
            }
            None => {
                debug!(user = %user_id, "Peer has not published a public key");
                self.cache.mark_missing(user_id).await;
                Ok(None)
            }
        }
    }

    /// Refetch a peer's key if the cached one is older than the refresh
    /// interval, and return the key now cached.
    pub async fn refresh_stale(&self, user_id: &str) -> Result<Option<String>> {
        if let Some(age) = self.cache.age(user_id).await {
            if age < self.refresh_interval {
                return Ok(self.cached(user_id).await);
            }
        }

        let previous = self.cached(user_id).await;
        let current = self.fetch_validated(user_id).await?;
        if current != previous {
            info!(
                user = %user_id,
                old = ?previous.as_deref().map(fingerprint),
                new = ?current.as_deref().map(fingerprint),
                "Peer public key changed"
            );
        }
        self.cache.replace(user_id, current.clone()).await;
        Ok(current)
    }

    /// The cached key without touching the network.
    pub async fn cached(&self, user_id: &str) -> Option<String> {
        match self.cache.lookup(user_id).await {
            CacheLookup::Hit(record) => Some(record.public_key),
            _ => None,
        }
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    /// A key that does not parse is treated like no key.
    async fn fetch_validated(&self, user_id: &str) -> Result<Option<String>> {
        let fetched = self.api.fetch_public_key(user_id).await?;
        Ok(fetched.filter(|key| match parse_public_key(key) {
            Ok(_) => true,
            Err(e) => {
                info!(user = %user_id, error = %e, "Ignoring malformed published key");
                false
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::api::SendMessageRequest;
    use crate::keys::IdentityKeyPair;
    use crate::models::{Conversation, Message};
    use crate::recovery::RecoveryBackup;
    use crate::types::SealChatError;

    #[derive(Default)]
    struct KeyServer {
        keys: Mutex<HashMap<String, String>>,
        fetches: AtomicUsize,
    }

    impl KeyServer {
        fn publish(&self, user: &str, key: String) {
            self.keys.lock().unwrap().insert(user.to_string(), key);
        }
    }

    #[async_trait::async_trait]
    impl MessagingApi for KeyServer {
        async fn publish_public_key(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.keys.lock().unwrap().get(user_id).cloned())
        }
        async fn fetch_conversations(&self, _: u32, _: u32) -> Result<Vec<Conversation>> {
            Ok(Vec::new())
        }
        async fn fetch_messages(&self, _: &str, _: u32, _: Option<&str>) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn send_message(&self, _: &SendMessageRequest) -> Result<Message> {
            Err(SealChatError::Network("unsupported".into()))
        }
        async fn mark_read(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn unread_count(&self) -> Result<u64> {
            Ok(0)
        }
        async fn fetch_recovery_backup(&self) -> Result<Option<RecoveryBackup>> {
            Ok(None)
        }
        async fn store_recovery_backup(&self, _: &RecoveryBackup) -> Result<()> {
            Ok(())
        }
        async fn delete_recovery_backup(&self) -> Result<()> {
            Ok(())
        }
    }

    fn directory(server: Arc<KeyServer>, refresh: Duration) -> PublicKeyDirectory<KeyServer> {
        PublicKeyDirectory::new(server, Duration::from_secs(60), refresh)
    }

    #[tokio::test]
    async fn test_cache_first() {
        let server = Arc::new(KeyServer::default());
        let bob = IdentityKeyPair::generate();
        server.publish("bob", bob.export_public_key());
        let directory = directory(server.clone(), Duration::from_secs(30));

        for _ in 0..3 {
            assert_eq!(
                directory.get_public_key("bob").await.unwrap(),
                Some(bob.export_public_key())
            );
        }
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_key_not_polled() {
        let server = Arc::new(KeyServer::default());
        let directory = directory(server.clone(), Duration::from_secs(30));

        assert_eq!(directory.get_public_key("carol").await.unwrap(), None);
        assert_eq!(directory.get_public_key("carol").await.unwrap(), None);
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotation_only_seen_through_refresh() {
        let server = Arc::new(KeyServer::default());
        let old_bob = IdentityKeyPair::generate();
        let new_bob = IdentityKeyPair::generate();
        server.publish("bob", old_bob.export_public_key());
        let directory = directory(server.clone(), Duration::ZERO);

        directory.get_public_key("bob").await.unwrap();
        server.publish("bob", new_bob.export_public_key());

        assert_eq!(
            directory.get_public_key("bob").await.unwrap(),
            Some(old_bob.export_public_key())
        );
        assert_eq!(
            directory.refresh_stale("bob").await.unwrap(),
            Some(new_bob.export_public_key())
        );
        assert_eq!(directory.cached("bob").await, Some(new_bob.export_public_key()));
    }

    #[tokio::test]
    async fn test_refresh_is_throttled() {
        let server = Arc::new(KeyServer::default());
        let bob = IdentityKeyPair::generate();
        server.publish("bob", bob.export_public_key());
        let directory = directory(server.clone(), Duration::from_secs(30));

        directory.get_public_key("bob").await.unwrap();
        directory.refresh_stale("bob").await.unwrap();
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_treated_as_missing() {
        let server = Arc::new(KeyServer::default());
        server.publish("mallory", "AAAA".to_string());
        let directory = directory(server, Duration::from_secs(30));
        assert_eq!(directory.get_public_key("mallory").await.unwrap(), None);
    }
}
