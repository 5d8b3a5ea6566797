//! Data models for SealChat.
//!
//! This module defines the wire shapes of messages and conversations, the
//! render model for message text, and the records used for optimistic sends.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedText;
use crate::types::{Result, SealChatError, UNDECRYPTABLE_PLACEHOLDER};

/// Prefix of the temporary id given to an optimistic message.
pub const PENDING_ID_PREFIX: &str = "pending-";

/// Message content: either fully encrypted or fully plain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Encrypted { ciphertext: String, iv: String },
    Plain { text: String },
}

impl From<EncryptedText> for Payload {
    fn from(value: EncryptedText) -> Self {
        Self::Encrypted {
            ciphertext: value.ciphertext,
            iv: value.iv,
        }
    }
}

/// A direct message as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id, or a `pending-` id while an optimistic send is in flight.
    #[serde(alias = "_id")]
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    /// Ciphertext (base64) when encrypted, otherwise the text itself.
    #[serde(rename = "message")]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(default)]
    is_encrypted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen_by: BTreeSet<String>,
}

impl Message {
    /// Creates a new message.
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: Option<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (content, iv, is_encrypted) = match payload {
            Payload::Encrypted { ciphertext, iv } => (ciphertext, Some(iv), true),
            Payload::Plain { text } => (text, None, false),
        };
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            receiver_id,
            content,
            iv,
            is_encrypted,
            created_at,
            seen_by: BTreeSet::new(),
        }
    }

    /// The message content. An encrypted message without an IV is malformed.
    pub fn payload(&self) -> Result<Payload> {
        if !self.is_encrypted {
            return Ok(Payload::Plain {
                text: self.content.clone(),
            });
        }
        match &self.iv {
            Some(iv) => Ok(Payload::Encrypted {
                ciphertext: self.content.clone(),
                iv: iv.clone(),
            }),
            None => Err(SealChatError::DecryptionError(format!(
                "message {} is marked encrypted but carries no IV",
                self.id
            ))),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Whether this message is still an unconfirmed optimistic insert.
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(PENDING_ID_PREFIX)
    }

    /// The other party of this message from `local_user_id`'s point of view.
    pub fn peer_of<'a>(&'a self, local_user_id: &str) -> Option<&'a str> {
        if self.sender_id == local_user_id {
            self.receiver_id.as_deref()
        } else {
            Some(self.sender_id.as_str())
        }
    }

    pub fn is_seen_by(&self, user_id: &str) -> bool {
        self.seen_by.contains(user_id)
    }

    /// Add a reader. Returns true if the set changed.
    pub fn mark_seen_by(&mut self, user_id: &str) -> bool {
        self.seen_by.insert(user_id.to_string())
    }
}

/// A conversation summary as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// The first participant that is not the local user.
    pub fn peer_of<'a>(&'a self, local_user_id: &str) -> Option<&'a str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != local_user_id)
    }

    /// Most recent activity: `updated_at` or the last message, whichever is later.
    pub fn activity(&self) -> DateTime<Utc> {
        match &self.last_message {
            Some(message) if message.created_at > self.updated_at => message.created_at,
            _ => self.updated_at,
        }
    }
}

/// What the presentation layer shows for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageText {
    /// Sent without encryption; shown as-is.
    Plain(String),
    /// Decrypted (or known locally because we sent it).
    Decrypted(String),
    /// Authentication failed or no key could be derived.
    Undecryptable,
}

impl MessageText {
    /// Text to render, with the placeholder for undecryptable messages.
    pub fn display(&self) -> &str {
        match self {
            Self::Plain(text) | Self::Decrypted(text) => text,
            Self::Undecryptable => UNDECRYPTABLE_PLACEHOLDER,
        }
    }

    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Self::Undecryptable)
    }
}

/// Delivery state of a message held in a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Optimistic insert awaiting the server.
    Pending,
    /// Known to the server.
    Delivered,
}

/// A message together with its render text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: Message,
    pub text: MessageText,
    pub delivery: Delivery,
}

impl StoredMessage {
    pub fn delivered(message: Message, text: MessageText) -> Self {
        Self {
            message,
            text,
            delivery: Delivery::Delivered,
        }
    }
}

/// Status of an optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// The POST is in flight.
    Sending,
    /// The last attempt failed; the message can be resent.
    Failed,
}

/// Client-side record of an unacknowledged send. The plaintext is kept until
/// the server confirms so the user can resend it.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub id: String,
    pub peer_id: String,
    pub plaintext: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub status: PendingStatus,
    pub last_error: Option<String>,
}

impl PendingSend {
    /// Creates a new pending send.
    pub fn new(peer_id: impl Into<String>, plaintext: impl Into<String>) -> Self {
        Self {
            id: format!("{}{}", PENDING_ID_PREFIX, Uuid::new_v4()),
            peer_id: peer_id.into(),
            plaintext: plaintext.into(),
            created_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            status: PendingStatus::Sending,
            last_error: None,
        }
    }

    /// Mark as currently sending.
    pub fn mark_sending(&mut self) {
        self.status = PendingStatus::Sending;
        self.attempts += 1;
        self.last_attempt = Some(Utc::now());
    }

    /// Mark as failed with an error.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = PendingStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Whether the message can be resent.
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.status == PendingStatus::Failed && self.attempts < max_attempts
    }
}

/// How an optimistic send was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOutcome {
    /// The server id replaced the temporary id.
    Confirmed { pending_id: String, message_id: String },
    /// The POST failed; the optimistic message was removed.
    RolledBack { pending_id: String, error: SealChatError },
    /// A push delivered the server copy first; the temporary copy was dropped.
    SupersededByDuplicate { pending_id: String, message_id: String },
}

impl PendingOutcome {
    pub fn pending_id(&self) -> &str {
        match self {
            Self::Confirmed { pending_id, .. }
            | Self::RolledBack { pending_id, .. }
            | Self::SupersededByDuplicate { pending_id, .. } => pending_id,
        }
    }

    /// Server id of the message, if the send was acknowledged.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Confirmed { message_id, .. } | Self::SupersededByDuplicate { message_id, .. } => {
                Some(message_id)
            }
            Self::RolledBack { .. } => None,
        }
    }
}

/// Result of applying a fetched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Applied {
        /// Items not already present.
        added: usize,
        /// Advisory: the page was full, so older items may exist.
        has_more: bool,
    },
    /// A newer request for the same list was issued; this result was dropped.
    Superseded,
}
