//! Transport interfaces for the messaging backend.
//!
//! This module provides the traits the host application implements over its
//! HTTP client and socket connection, together with the request and response
//! shapes. Implementations can use any HTTP or socket library.

use serde::{Deserialize, Serialize};

use crate::events::OutboundEvent;
use crate::models::{Conversation, Message, Payload};
use crate::recovery::RecoveryBackup;
use crate::types::Result;

/// Connection settings for the messaging backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the REST API.
    pub api_url: String,
    /// URL of the real-time event channel.
    pub socket_url: String,
}

impl BackendConfig {
    /// Creates a configuration for the given endpoints.
    pub fn new(api_url: &str, socket_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            socket_url: socket_url.to_string(),
        }
    }

    /// Creates configuration for a backend running on this machine.
    pub fn localhost() -> Self {
        Self::new("http://localhost:5000/api", "ws://localhost:5000")
    }

    /// Full URL for a path under the REST API.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }
}

/// Body of `POST /messages/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: String,
    /// Ciphertext (base64) or plain text.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub is_encrypted: bool,
}

impl SendMessageRequest {
    pub fn new(receiver_id: impl Into<String>, payload: Payload) -> Self {
        let receiver_id = receiver_id.into();
        match payload {
            Payload::Encrypted { ciphertext, iv } => Self {
                receiver_id,
                message: ciphertext,
                iv: Some(iv),
                is_encrypted: true,
            },
            Payload::Plain { text } => Self {
                receiver_id,
                message: text,
                iv: None,
                is_encrypted: false,
            },
        }
    }
}

/// Body of `GET /messages/public-key/{userId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Body of `GET /messages/unread-count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

/// Trait for the REST side of the messaging backend.
///
/// Every method is authenticated by the implementor (bearer token).
/// Transport failures are reported as `SealChatError::Network`.
#[async_trait::async_trait]
pub trait MessagingApi: Send + Sync {
    /// `POST /messages/public-key`. Idempotent.
    async fn publish_public_key(&self, public_key: &str) -> Result<()>;

    /// `GET /messages/public-key/{userId}`; `None` if the user never published.
    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>>;

    /// `GET /messages/conversations?page&limit`.
    async fn fetch_conversations(&self, page: u32, limit: u32) -> Result<Vec<Conversation>>;

    /// `GET /messages/{peerId}?limit&before`, in either chronological order.
    async fn fetch_messages(
        &self,
        peer_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<Message>>;

    /// `POST /messages/send`; returns the stored message with its server id.
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message>;

    /// `PUT /messages/read`.
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;

    /// `GET /messages/unread-count`.
    async fn unread_count(&self) -> Result<u64>;

    /// Fetch this account's wrapped-key backup.
    async fn fetch_recovery_backup(&self) -> Result<Option<RecoveryBackup>>;

    /// Create or replace this account's wrapped-key backup.
    async fn store_recovery_backup(&self, backup: &RecoveryBackup) -> Result<()>;

    /// Remove this account's wrapped-key backup.
    async fn delete_recovery_backup(&self) -> Result<()>;
}

/// Trait for emitting events on the real-time channel.
#[async_trait::async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn emit(&self, event: OutboundEvent) -> Result<()>;
}
