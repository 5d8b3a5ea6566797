//! Registry of unacknowledged sends.
//!
//! Every optimistic send gets a [`PendingSend`] record here. The record keeps
//! the plaintext until the server acknowledges the message, so a failed send
//! can be offered for resend.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::models::{PendingSend, PendingStatus};
use crate::types::{Result, SealChatError};

/// Configuration for the send queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum number of attempts per message.
    pub max_attempts: u32,
    /// Maximum number of unacknowledged messages.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_queue_size: 100,
        }
    }
}

/// A queue of pending outgoing messages.
pub struct SendQueue {
    queue: Arc<RwLock<VecDeque<PendingSend>>>,
    config: QueueConfig,
}

impl SendQueue {
    /// Creates a new send queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queue: Arc::new(RwLock::new(VecDeque::new())),
            config,
        }
    }

    /// Creates a new send queue with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(QueueConfig::default())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueues a new message and marks it as sending.
    pub async fn enqueue(&self, mut message: PendingSend) -> Result<PendingSend> {
        let mut queue = self.queue.write().await;

        if queue.len() >= self.config.max_queue_size {
            // Make room by dropping failures that can no longer be resent
            let max_attempts = self.config.max_attempts;
            queue.retain(|m| m.status != PendingStatus::Failed || m.can_retry(max_attempts));

            if queue.len() >= self.config.max_queue_size {
                return Err(SealChatError::QueueFull);
            }
        }

        message.mark_sending();
        queue.push_back(message.clone());
        Ok(message)
    }

    pub async fn get(&self, id: &str) -> Option<PendingSend> {
        let queue = self.queue.read().await;
        queue.iter().find(|m| m.id == id).cloned()
    }

    /// Marks a failed message as sending again.
    pub async fn begin_retry(&self, id: &str) -> Result<PendingSend> {
        let mut queue = self.queue.write().await;

        let msg = queue
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| SealChatError::MessageNotFound(id.to_string()))?;

        match msg.status {
            PendingStatus::Sending => Err(SealChatError::SendInProgress(id.to_string())),
            PendingStatus::Failed if !msg.can_retry(self.config.max_attempts) => {
                Err(SealChatError::RetriesExhausted(id.to_string()))
            }
            PendingStatus::Failed => {
                msg.mark_sending();
                Ok(msg.clone())
            }
        }
    }

    /// Marks a message as failed with an error.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut queue = self.queue.write().await;

        if let Some(msg) = queue.iter_mut().find(|m| m.id == id) {
            msg.mark_failed(error.to_string());
            Ok(())
        } else {
            Err(SealChatError::MessageNotFound(id.to_string()))
        }
    }

    /// Removes an acknowledged or abandoned message.
    pub async fn remove(&self, id: &str) -> Option<PendingSend> {
        let mut queue = self.queue.write().await;

        if let Some(pos) = queue.iter().position(|m| m.id == id) {
            queue.remove(pos)
        } else {
            None
        }
    }

    /// All messages whose last attempt failed.
    pub async fn failed(&self) -> Vec<PendingSend> {
        let queue = self.queue.read().await;
        queue
            .iter()
            .filter(|m| m.status == PendingStatus::Failed)
            .cloned()
            .collect()
    }

    /// Messages for a specific peer.
    pub async fn messages_for(&self, peer_id: &str) -> Vec<PendingSend> {
        let queue = self.queue.read().await;
        queue
            .iter()
            .filter(|m| m.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Clears all messages from the queue.
    pub async fn clear(&self) {
        let mut queue = self.queue.write().await;
        queue.clear();
    }

    /// Returns the number of messages in the queue.
    pub async fn len(&self) -> usize {
        let queue = self.queue.read().await;
        queue.len()
    }

    /// Returns true if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        let queue = self.queue.read().await;
        queue.is_empty()
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}
