//! Main SealChat client.
//!
//! This module wires the identity, recovery, key directory and sync
//! components together and runs session start-up.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{BackendConfig, MessagingApi, RealtimeChannel};
use crate::directory::PublicKeyDirectory;
use crate::events::{EventDispatcher, InboundEvent};
use crate::queue::QueueConfig;
use crate::recovery::{
    KdfParams, RecoveryBackup, RecoveryState, RecoveryVault, ResetConfirmation, ResetOutcome,
};
use crate::secrets::SharedSecretCache;
use crate::storage::KeyStorage;
use crate::sync::{ConversationSync, SyncConfig};
use crate::types::{Result, SealChatError};
use crate::vault::KeyVault;

fn default_missing_key_retry_secs() -> u64 {
    60
}

fn default_key_refresh_interval_secs() -> u64 {
    30
}

/// Configuration for the SealChat client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealChatConfig {
    /// The signed-in user's id.
    pub user_id: String,
    /// Backend endpoints.
    pub backend: BackendConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub kdf: KdfParams,
    /// How long a "no published key" answer is trusted.
    #[serde(default = "default_missing_key_retry_secs")]
    pub missing_key_retry_secs: u64,
    /// Minimum time between rotation refetches of one peer's key.
    #[serde(default = "default_key_refresh_interval_secs")]
    pub key_refresh_interval_secs: u64,
}

impl SealChatConfig {
    /// Creates a configuration with default paging, queue and KDF settings.
    pub fn new(user_id: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            user_id: user_id.into(),
            backend,
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            kdf: KdfParams::default(),
            missing_key_retry_secs: default_missing_key_retry_secs(),
            key_refresh_interval_secs: default_key_refresh_interval_secs(),
        }
    }

    /// Creates a configuration for a backend on this machine.
    pub fn localhost(user_id: impl Into<String>) -> Self {
        Self::new(user_id, BackendConfig::localhost())
    }

    pub fn with_page_sizes(mut self, conversations: u32, messages: u32) -> Self {
        self.sync.conversation_page_size = conversations;
        self.sync.message_page_size = messages;
        self
    }

    pub fn with_auto_mark_read(mut self, enabled: bool) -> Self {
        self.sync.auto_mark_read = enabled;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_missing_key_retry(mut self, retry: Duration) -> Self {
        self.missing_key_retry_secs = retry.as_secs();
        self
    }

    pub fn with_key_refresh_interval(mut self, interval: Duration) -> Self {
        self.key_refresh_interval_secs = interval.as_secs();
        self
    }

    pub fn missing_key_retry(&self) -> Duration {
        Duration::from_secs(self.missing_key_retry_secs)
    }

    pub fn key_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.key_refresh_interval_secs)
    }
}

/// Outcome of [`SealChat::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// An identity is loaded.
    Ready {
        public_key: String,
        newly_generated: bool,
        /// False if publishing the public key failed; retried on next start.
        published: bool,
        recovery: RecoveryState,
    },
    /// No local key but a server backup exists; ask for the PIN.
    RecoveryRequired,
    /// Local key storage failed. Messages are sent unencrypted and received
    /// ciphertext is shown as undecryptable.
    EncryptionUnavailable { reason: SealChatError },
}

/// The main SealChat client.
pub struct SealChat<A, S, R>
where
    A: MessagingApi,
    S: KeyStorage,
    R: RealtimeChannel,
{
    config: SealChatConfig,
    api: Arc<A>,
    vault: Arc<KeyVault<S>>,
    recovery: RecoveryVault<A, S>,
    directory: Arc<PublicKeyDirectory<A>>,
    secrets: Arc<SharedSecretCache>,
    sync: ConversationSync<A, S, R>,
    events: EventDispatcher,
}

impl<A, S, R> SealChat<A, S, R>
where
    A: MessagingApi,
    S: KeyStorage,
    R: RealtimeChannel,
{
    /// Creates a client. Call [`SealChat::initialize`] before messaging.
    pub fn new(config: SealChatConfig, api: Arc<A>, key_storage: S, realtime: Arc<R>) -> Self {
        let vault = Arc::new(KeyVault::new(config.user_id.clone(), key_storage));
        let recovery = RecoveryVault::new(api.clone(), vault.clone(), config.kdf);
        let directory = Arc::new(PublicKeyDirectory::new(
            api.clone(),
            config.missing_key_retry(),
            config.key_refresh_interval(),
        ));
        let secrets = Arc::new(SharedSecretCache::new());
        let sync = ConversationSync::new(
            config.sync.clone(),
            config.queue.clone(),
            api.clone(),
            realtime,
            vault.clone(),
            directory.clone(),
            secrets.clone(),
        );

        Self {
            config,
            api,
            vault,
            recovery,
            directory,
            secrets,
            sync,
            events: EventDispatcher::new(),
        }
    }

    /// Load or create the identity and publish its public key.
    ///
    /// Without a local key, an existing server backup means the user must
    /// recover with their PIN; no new identity is generated in that case.
    pub async fn initialize(&self) -> Result<SessionStatus> {
        let has_identity = match self.vault.has_identity().await {
            Ok(has) => has,
            Err(e) => {
                warn!(user = %self.config.user_id, error = %e, "Encryption unavailable");
                return Ok(SessionStatus::EncryptionUnavailable { reason: e });
            }
        };

        if !has_identity && self.api.fetch_recovery_backup().await?.is_some() {
            self.recovery.refresh_state().await?;
            info!(user = %self.config.user_id, "Recovery backup found; PIN required");
            return Ok(SessionStatus::RecoveryRequired);
        }

        let ensured = match self.vault.ensure_identity().await {
            Ok(ensured) => ensured,
            Err(e @ SealChatError::KeyStorage(_)) => {
                warn!(user = %self.config.user_id, error = %e, "Encryption unavailable");
                return Ok(SessionStatus::EncryptionUnavailable { reason: e });
            }
            Err(e) => return Err(e),
        };

        let published = match self.api.publish_public_key(&ensured.public_key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Public key not published; will retry on next start");
                false
            }
        };

        let recovery = match self.recovery.refresh_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Could not check recovery backup");
                self.recovery.state().await
            }
        };

        Ok(SessionStatus::Ready {
            public_key: ensured.public_key,
            newly_generated: ensured.newly_generated,
            published,
            recovery,
        })
    }

    /// Create a PIN backup of the current identity.
    pub async fn setup_recovery(&self, pin: &str) -> Result<RecoveryBackup> {
        self.recovery.setup_recovery(pin).await
    }

    /// Restore the identity from the PIN backup. `false` means a wrong PIN.
    pub async fn recover_keys(&self, pin: &str) -> Result<bool> {
        let recovered = self.recovery.recover_keys(pin).await?;
        if recovered {
            self.sync.on_identity_changed().await;
        }
        Ok(recovered)
    }

    /// Re-wrap the backup under `new_pin`. On a locked device this also
    /// restores the identity, as [`SealChat::recover_keys`] does.
    pub async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<bool> {
        let was_locked = self.vault.current().await.is_none();
        let changed = self.recovery.change_pin(old_pin, new_pin).await?;
        if changed && was_locked {
            self.sync.on_identity_changed().await;
        }
        Ok(changed)
    }

    /// Replace the identity. Old messages become permanently unreadable.
    pub async fn reset_encryption_keys(
        &self,
        confirmation: ResetConfirmation,
    ) -> Result<ResetOutcome> {
        let outcome = self.recovery.reset_encryption_keys(confirmation).await?;
        self.sync.on_identity_changed().await;
        Ok(outcome)
    }

    /// Feed one socket frame in: apply it to the sync state and forward it
    /// to event subscribers.
    pub async fn handle_socket_event(&self, name: &str, payload: Value) -> Result<()> {
        let event = InboundEvent::from_wire(name, payload)?;
        self.sync.handle_event(event.clone()).await;
        self.events.dispatch(event);
        Ok(())
    }

    pub fn config(&self) -> &SealChatConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn vault(&self) -> &KeyVault<S> {
        &self.vault
    }

    pub fn recovery(&self) -> &RecoveryVault<A, S> {
        &self.recovery
    }

    pub fn directory(&self) -> &PublicKeyDirectory<A> {
        &self.directory
    }

    pub fn secrets(&self) -> &SharedSecretCache {
        &self.secrets
    }

    pub fn sync(&self) -> &ConversationSync<A, S, R> {
        &self.sync
    }

    /// Subscribe here to observe inbound events after they were applied.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }
}
