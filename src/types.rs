//! Type definitions and protocol constants for SealChat.

use thiserror::Error;

/// Size of an X25519 public or private key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce ("iv" on the wire) in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of the per-backup Argon2 salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Maximum plaintext size accepted for a single message.
pub const MAX_PLAINTEXT_SIZE: usize = 64 * 1024;

/// Number of digits in a recovery PIN.
pub const PIN_LENGTH: usize = 6;

/// HKDF salt for conversation keys.
pub const KEY_DERIVATION_SALT: &[u8] = b"SealChat-v1-conversation";

/// HKDF info prefix for conversation keys; both public keys follow in sorted order.
pub const CONVERSATION_KEY_INFO_PREFIX: &[u8] = b"SealChatV1-DM";

/// Associated data bound into every recovery wrap.
pub const RECOVERY_WRAP_AAD: &[u8] = b"SealChatV1-Recovery";

/// Current recovery backup format version.
pub const RECOVERY_BACKUP_VERSION: u8 = 1;

/// Text shown in place of a message that failed authentication.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "Message could not be decrypted";

/// Errors that can occur during SealChat operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealChatError {
    // Key Errors
    /// Local key storage is unavailable or its contents are corrupted.
    #[error("Key storage failed: {0}")]
    KeyStorage(String),

    /// No local identity is loaded.
    #[error("No local identity available")]
    NoIdentity,

    /// Invalid public key format.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Could not derive a symmetric key.
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // Recovery Errors
    /// PIN is not exactly six digits.
    #[error("PIN must be exactly {PIN_LENGTH} digits")]
    InvalidPinFormat,

    /// PIN did not unwrap the backup.
    #[error("PIN does not match the recovery backup")]
    PinMismatch,

    /// The server holds no recovery backup for this account.
    #[error("No recovery backup exists for this account")]
    RecoveryBackupMissing,

    /// A backup exists but the identity has not been recovered with the PIN.
    #[error("Identity is locked; recover it with the PIN first")]
    RecoveryRequired,

    // Encryption Errors
    /// Message too large.
    #[error("Message too large: {0} bytes (max {MAX_PLAINTEXT_SIZE})")]
    MessageTooLarge(usize),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed.
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    // Transport Errors
    /// A backend or socket call failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Inbound event with a name this crate does not handle.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // Queue Errors
    /// Pending send not found.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Too many unacknowledged sends.
    #[error("Send queue is full")]
    QueueFull,

    /// A resend was requested while the previous attempt is in flight.
    #[error("Message is already being sent: {0}")]
    SendInProgress(String),

    /// The message reached the attempt limit.
    #[error("Message has exceeded max attempts: {0}")]
    RetriesExhausted(String),
}

impl SealChatError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<serde_json::Error> for SealChatError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SealChatError>;
