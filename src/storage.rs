//! Storage interfaces and implementations for SealChat.
//!
//! This module provides the trait for persisting the local identity's
//! private key, an in-memory and a file-backed implementation, and the
//! session cache for peers' public keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{Result, SealChatError, KEY_SIZE};

// ============================================================================
// Identity Key Storage
// ============================================================================

/// Trait for storing identity private keys on the device.
#[async_trait::async_trait]
pub trait KeyStorage: Send + Sync {
    /// Store the private key for a user, replacing any previous one.
    async fn store(&self, private_key: &[u8; KEY_SIZE], user_id: &str) -> Result<()>;

    /// Retrieve the private key for a user, `None` if nothing is stored.
    async fn retrieve(&self, user_id: &str) -> Result<Option<[u8; KEY_SIZE]>>;

    /// Delete the key for a user. Deleting a missing key is not an error.
    async fn delete(&self, user_id: &str) -> Result<()>;
}

/// In-memory implementation of KeyStorage (for testing).
///
/// WARNING: keys are held unencrypted in memory and are lost when the
/// process exits.
#[derive(Default)]
pub struct InMemoryKeyStorage {
    keys: Arc<RwLock<HashMap<String, [u8; KEY_SIZE]>>>,
}

impl InMemoryKeyStorage {
    /// Creates a new in-memory key storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyStorage for InMemoryKeyStorage {
    async fn store(&self, private_key: &[u8; KEY_SIZE], user_id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.insert(user_id.to_string(), *private_key);
        Ok(())
    }

    async fn retrieve(&self, user_id: &str) -> Result<Option<[u8; KEY_SIZE]>> {
        let keys = self.keys.read().await;
        Ok(keys.get(user_id).copied())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.remove(user_id);
        Ok(())
    }
}

/// On-disk document written by [`FileKeyStorage`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u8,
    user_id: String,
    private_key: String,
    created_at: DateTime<Utc>,
}

/// Stores one JSON document per user inside a directory.
pub struct FileKeyStorage {
    dir: PathBuf,
}

impl FileKeyStorage {
    /// Creates a storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let file_name: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.identity.json", file_name))
    }

    async fn read_document(path: &Path) -> Result<Option<StoredIdentity>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SealChatError::KeyStorage(format!("read failed: {}", e))),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SealChatError::KeyStorage(format!("corrupted identity file: {}", e)))
    }
}

#[async_trait::async_trait]
impl KeyStorage for FileKeyStorage {
    async fn store(&self, private_key: &[u8; KEY_SIZE], user_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SealChatError::KeyStorage(format!("cannot create key directory: {}", e)))?;

        let document = StoredIdentity {
            version: 1,
            user_id: user_id.to_string(),
            private_key: STANDARD.encode(private_key),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&document)?;

        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SealChatError::KeyStorage(format!("write failed: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SealChatError::KeyStorage(format!("rename failed: {}", e)))
    }

    async fn retrieve(&self, user_id: &str) -> Result<Option<[u8; KEY_SIZE]>> {
        let Some(document) = Self::read_document(&self.path_for(user_id)).await? else {
            return Ok(None);
        };

        if document.user_id != user_id {
            return Err(SealChatError::KeyStorage(format!(
                "identity file belongs to {}",
                document.user_id
            )));
        }

        let bytes = STANDARD
            .decode(&document.private_key)
            .map_err(|e| SealChatError::KeyStorage(format!("corrupted private key: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            SealChatError::KeyStorage(format!("private key has {} bytes", bytes.len()))
        })?;
        Ok(Some(key))
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SealChatError::KeyStorage(format!("delete failed: {}", e))),
        }
    }
}

// ============================================================================
// Public Key Cache
// ============================================================================

/// A peer's published public key as last seen by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRecord {
    pub user_id: String,
    pub public_key: String,
    pub fetched_at: DateTime<Utc>,
}

enum CacheEntry {
    Present {
        record: PublicKeyRecord,
        refreshed_at: Instant,
    },
    /// The backend answered "no key"; remembered until `retry_at`.
    Missing { retry_at: Instant },
}

/// Session cache for peers' public keys.
///
/// Present entries never expire on their own; they are replaced only through
/// [`PublicKeyCache::replace`]. Negative answers are remembered for a bounded
/// time so an unpublished peer is not polled on every message.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    missing_ttl: Duration,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(PublicKeyRecord),
    /// Known to have no published key; do not ask the backend yet.
    KnownMissing,
    Miss,
}

impl PublicKeyCache {
    /// Creates a cache that remembers missing keys for `missing_ttl`.
    pub fn new(missing_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            missing_ttl,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> CacheLookup {
        let cache = self.cache.read().await;
        match cache.get(user_id) {
            Some(CacheEntry::Present { record, .. }) => CacheLookup::Hit(record.clone()),
            Some(CacheEntry::Missing { retry_at }) if *retry_at > Instant::now() => {
                CacheLookup::KnownMissing
            }
            _ => CacheLookup::Miss,
        }
    }

    /// Store a key for a user that has no present entry yet.
    ///
    /// Returns the entry that ends up cached, which is the existing one if a
    /// concurrent fetch got there first.
    pub async fn insert(&self, user_id: &str, public_key: String) -> PublicKeyRecord {
        let mut cache = self.cache.write().await;
        if let Some(CacheEntry::Present { record, .. }) = cache.get(user_id) {
            return record.clone();
        }
        let record = PublicKeyRecord {
            user_id: user_id.to_string(),
            public_key,
            fetched_at: Utc::now(),
        };
        cache.insert(
            user_id.to_string(),
            CacheEntry::Present {
                record: record.clone(),
                refreshed_at: Instant::now(),
            },
        );
        record
    }

    /// Overwrite the entry for a user after a rotation refetch.
    pub async fn replace(&self, user_id: &str, public_key: Option<String>) {
        let mut cache = self.cache.write().await;
        let entry = match public_key {
            Some(public_key) => CacheEntry::Present {
                record: PublicKeyRecord {
                    user_id: user_id.to_string(),
                    public_key,
                    fetched_at: Utc::now(),
                },
                refreshed_at: Instant::now(),
            },
            None => CacheEntry::Missing {
                retry_at: Instant::now() + self.missing_ttl,
            },
        };
        cache.insert(user_id.to_string(), entry);
    }

    /// Remember that a user has not published a key.
    pub async fn mark_missing(&self, user_id: &str) {
        let mut cache = self.cache.write().await;
        if matches!(cache.get(user_id), Some(CacheEntry::Present { .. })) {
            return;
        }
        cache.insert(
            user_id.to_string(),
            CacheEntry::Missing {
                retry_at: Instant::now() + self.missing_ttl,
            },
        );
    }

    /// Time since the present entry for a user was fetched or refreshed.
    pub async fn age(&self, user_id: &str) -> Option<Duration> {
        let cache = self.cache.read().await;
        match cache.get(user_id) {
            Some(CacheEntry::Present { refreshed_at, .. }) => Some(refreshed_at.elapsed()),
            _ => None,
        }
    }

    /// Clear all cached keys.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
