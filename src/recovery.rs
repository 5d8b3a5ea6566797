//! PIN-protected backup of the identity private key.
//!
//! The private key is wrapped with ChaCha20-Poly1305 under a key derived from
//! a six-digit PIN with Argon2id and stored server-side. A new device unwraps
//! it with the same PIN. A wrong PIN fails the authentication tag, which is
//! reported as a normal `false` result.

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::MessagingApi;
use crate::crypto::{decode_nonce, generate_nonce, open, seal};
use crate::storage::KeyStorage;
use crate::types::{
    Result, SealChatError, KEY_SIZE, PIN_LENGTH, RECOVERY_BACKUP_VERSION, RECOVERY_WRAP_AAD,
    SALT_SIZE,
};
use crate::vault::KeyVault;

/// Warning that must be shown before [`RecoveryVault::reset_encryption_keys`].
pub const RESET_WARNING: &str = "Resetting your encryption keys deletes your recovery backup \
and creates a new identity. Every message encrypted under your current keys, sent or \
received, will be permanently unreadable on every device. This cannot be undone.";

/// Password-KDF algorithm used for a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    Argon2id,
}

/// Argon2 cost parameters, stored alongside each backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn argon2id(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

impl Default for KdfParams {
    /// 19 MiB, 2 passes, 1 lane.
    fn default() -> Self {
        Self::argon2id(19 * 1024, 2, 1)
    }
}

/// The server-side wrapped-key blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryBackup {
    pub version: u8,
    pub wrapped_private_key: String,
    pub salt: String,
    pub iv: String,
    pub kdf_params: KdfParams,
}

/// Recovery state of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// An identity exists but no PIN backup has been set up.
    NoBackup,
    /// A backup exists but this session has no usable private key.
    Locked,
    /// The private key is available and a backup exists.
    Unlocked,
}

/// Proof that the user saw [`RESET_WARNING`] and agreed to lose old messages.
#[derive(Debug)]
pub struct ResetConfirmation {
    _acknowledged: (),
}

impl ResetConfirmation {
    /// Returns a confirmation only if `displayed_warning` is exactly [`RESET_WARNING`].
    pub fn acknowledge(displayed_warning: &str) -> Option<Self> {
        (displayed_warning == RESET_WARNING).then_some(Self { _acknowledged: () })
    }
}

/// Result of a key reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub public_key: String,
    /// False if the new key could not be published yet; the next session start retries.
    pub published: bool,
}

/// Check that a PIN is exactly six ASCII digits.
pub fn validate_pin(pin: &str) -> Result<()> {
    if pin.len() == PIN_LENGTH && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(SealChatError::InvalidPinFormat)
    }
}

fn derive_wrapping_key(
    pin: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| SealChatError::KeyDerivationFailed(format!("invalid KDF params: {}", e)))?;
    let argon2 = match params.algorithm {
        KdfAlgorithm::Argon2id => Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params),
    };

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(pin.as_bytes(), salt, &mut key[..])
        .map_err(|e| SealChatError::KeyDerivationFailed(format!("Argon2 failed: {}", e)))?;
    Ok(key)
}

/// Run the slow KDF off the async executor.
async fn derive_wrapping_key_blocking(
    pin: &str,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let pin = Zeroizing::new(pin.to_string());
    tokio::task::spawn_blocking(move || derive_wrapping_key(&pin, &salt, &params))
        .await
        .map_err(|e| SealChatError::KeyDerivationFailed(format!("KDF task failed: {}", e)))?
}

fn wrap_aad(version: u8) -> Vec<u8> {
    let mut aad = RECOVERY_WRAP_AAD.to_vec();
    aad.push(version);
    aad
}

/// Wrap a private key under a PIN with a fresh salt and nonce.
pub async fn wrap_private_key(
    private_key: &[u8; KEY_SIZE],
    pin: &str,
    params: KdfParams,
) -> Result<RecoveryBackup> {
    validate_pin(pin)?;

    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let wrapping_key = derive_wrapping_key_blocking(pin, salt.to_vec(), params).await?;

    let nonce = generate_nonce();
    let wrapped = seal(
        &wrapping_key,
        &nonce,
        private_key,
        &wrap_aad(RECOVERY_BACKUP_VERSION),
    )?;

    Ok(RecoveryBackup {
        version: RECOVERY_BACKUP_VERSION,
        wrapped_private_key: STANDARD.encode(wrapped),
        salt: STANDARD.encode(salt),
        iv: STANDARD.encode(nonce),
        kdf_params: params,
    })
}

/// Unwrap a backup. A wrong PIN yields `PinMismatch`.
pub async fn unwrap_private_key(
    backup: &RecoveryBackup,
    pin: &str,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    validate_pin(pin)?;
    if backup.version != RECOVERY_BACKUP_VERSION {
        return Err(SealChatError::KeyDerivationFailed(format!(
            "unsupported backup version {}",
            backup.version
        )));
    }

    let salt = STANDARD
        .decode(&backup.salt)
        .map_err(|e| SealChatError::KeyDerivationFailed(format!("corrupted salt: {}", e)))?;
    let nonce = decode_nonce(&backup.iv)?;
    let wrapped = STANDARD
        .decode(&backup.wrapped_private_key)
        .map_err(|e| SealChatError::DecryptionError(format!("corrupted backup: {}", e)))?;

    let wrapping_key = derive_wrapping_key_blocking(pin, salt, backup.kdf_params).await?;
    let unwrapped = Zeroizing::new(
        open(&wrapping_key, &nonce, &wrapped, &wrap_aad(backup.version))
            .map_err(|_| SealChatError::PinMismatch)?,
    );

    let key: [u8; KEY_SIZE] = unwrapped.as_slice().try_into().map_err(|_| {
        SealChatError::DecryptionError(format!("unwrapped key has {} bytes", unwrapped.len()))
    })?;
    Ok(Zeroizing::new(key))
}

/// Manages the PIN backup of the local identity.
pub struct RecoveryVault<A: MessagingApi, S: KeyStorage> {
    api: Arc<A>,
    vault: Arc<KeyVault<S>>,
    kdf_params: KdfParams,
    state: RwLock<RecoveryState>,
}

impl<A: MessagingApi, S: KeyStorage> RecoveryVault<A, S> {
    pub fn new(api: Arc<A>, vault: Arc<KeyVault<S>>, kdf_params: KdfParams) -> Self {
        Self {
            api,
            vault,
            kdf_params,
            state: RwLock::new(RecoveryState::NoBackup),
        }
    }

    pub async fn state(&self) -> RecoveryState {
        *self.state.read().await
    }

    /// Recompute the state from the loaded identity and the server's backup.
    pub async fn refresh_state(&self) -> Result<RecoveryState> {
        let has_backup = self.api.fetch_recovery_backup().await?.is_some();
        let has_key = self.vault.current().await.is_some();

        let state = match (has_key, has_backup) {
            (_, false) => RecoveryState::NoBackup,
            (true, true) => RecoveryState::Unlocked,
            (false, true) => RecoveryState::Locked,
        };
        self.vault.set_awaiting_recovery(state == RecoveryState::Locked);
        *self.state.write().await = state;
        Ok(state)
    }

    /// Wrap the current private key under `pin` and upload it.
    pub async fn setup_recovery(&self, pin: &str) -> Result<RecoveryBackup> {
        validate_pin(pin)?;
        let key_pair = self.vault.require().await?;

        let backup = wrap_private_key(&key_pair.private_bytes(), pin, self.kdf_params).await?;
        self.api.store_recovery_backup(&backup).await?;

        *self.state.write().await = RecoveryState::Unlocked;
        info!(
            user = %self.vault.user_id(),
            key = %key_pair.fingerprint(),
            "Recovery backup created"
        );
        Ok(backup)
    }

    /// Restore the identity from the server backup.
    ///
    /// Returns `Ok(false)` for a wrong PIN and leaves every state untouched.
    pub async fn recover_keys(&self, pin: &str) -> Result<bool> {
        validate_pin(pin)?;
        let backup = self
            .api
            .fetch_recovery_backup()
            .await?
            .ok_or(SealChatError::RecoveryBackupMissing)?;

        let private_key = match unwrap_private_key(&backup, pin).await {
            Ok(key) => key,
            Err(SealChatError::PinMismatch) => {
                warn!(user = %self.vault.user_id(), "Recovery PIN rejected");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.install_recovered(*private_key).await?;
        *self.state.write().await = RecoveryState::Unlocked;
        Ok(true)
    }

    /// Install recovered key material and republish its public key.
    async fn install_recovered(&self, private_key: [u8; KEY_SIZE]) -> Result<()> {
        let key_pair = self.vault.install(private_key).await?;
        if let Err(e) = self.api.publish_public_key(&key_pair.export_public_key()).await {
            warn!(error = %e, "Failed to republish recovered public key");
        }
        Ok(())
    }

    /// Re-wrap the backup under a new PIN.
    ///
    /// Returns `Ok(false)` without changing anything if `old_pin` is wrong.
    pub async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<bool> {
        validate_pin(old_pin)?;
        validate_pin(new_pin)?;

        let backup = self
            .api
            .fetch_recovery_backup()
            .await?
            .ok_or(SealChatError::RecoveryBackupMissing)?;

        let private_key = match unwrap_private_key(&backup, old_pin).await {
            Ok(key) => key,
            Err(SealChatError::PinMismatch) => {
                warn!(user = %self.vault.user_id(), "PIN change rejected: old PIN mismatch");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let rewrapped = wrap_private_key(&private_key, new_pin, self.kdf_params).await?;
        self.api.store_recovery_backup(&rewrapped).await?;

        if self.vault.current().await.is_none() {
            self.install_recovered(*private_key).await?;
        }
        *self.state.write().await = RecoveryState::Unlocked;
        info!(user = %self.vault.user_id(), "Recovery PIN changed");
        Ok(true)
    }

    /// Destroy the identity and backup and start over with a new key pair.
    ///
    /// Messages encrypted under the old identity become permanently
    /// unreadable. See [`RESET_WARNING`].
    pub async fn reset_encryption_keys(
        &self,
        _confirmation: ResetConfirmation,
    ) -> Result<ResetOutcome> {
        warn!(user = %self.vault.user_id(), "Resetting encryption keys");

        self.api.delete_recovery_backup().await?;
        self.vault.destroy().await?;
        let ensured = self.vault.ensure_identity().await?;

        let published = match self.api.publish_public_key(&ensured.public_key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "New public key not published; will retry on next start");
                false
            }
        };

        *self.state.write().await = RecoveryState::NoBackup;
        info!(
            user = %self.vault.user_id(),
            key = %ensured.key_pair.fingerprint(),
            "Encryption keys reset"
        );
        Ok(ResetOutcome {
            public_key: ensured.public_key,
            published,
        })
    }
}
