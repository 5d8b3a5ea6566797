//! Conversation synchronization.
//!
//! [`ConversationSync`] drives the [`ConversationStore`] from three sources:
//! REST pages, optimistic sends and real-time events. It encrypts outgoing
//! text and decrypts incoming text on the way in. Store locks are never held
//! across a network call.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::api::{MessagingApi, RealtimeChannel, SendMessageRequest};
use crate::crypto::{decrypt_text, encrypt_text, SymmetricKey};
use crate::directory::PublicKeyDirectory;
use crate::events::{InboundEvent, OutboundEvent, ReadReceipt, Subscription};
use crate::models::{
    Delivery, Message, MessageText, PageOutcome, Payload, PendingOutcome, PendingSend,
    StoredMessage,
};
use crate::queue::{QueueConfig, SendQueue};
use crate::secrets::SharedSecretCache;
use crate::storage::KeyStorage;
use crate::store::{ConversationEntry, ConversationStore, PageKind};
use crate::types::{Result, SealChatError, MAX_PLAINTEXT_SIZE};
use crate::vault::KeyVault;

/// Paging and read-receipt behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub conversation_page_size: u32,
    pub message_page_size: u32,
    /// Mark peer messages read as they arrive in the open conversation.
    pub auto_mark_read: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_page_size: 20,
            message_page_size: 15,
            auto_mark_read: true,
        }
    }
}

/// Keeps conversations and messages in sync with the backend.
pub struct ConversationSync<A, S, R>
where
    A: MessagingApi,
    S: KeyStorage,
    R: RealtimeChannel,
{
    config: SyncConfig,
    api: Arc<A>,
    realtime: Arc<R>,
    vault: Arc<KeyVault<S>>,
    directory: Arc<PublicKeyDirectory<A>>,
    secrets: Arc<SharedSecretCache>,
    store: RwLock<ConversationStore>,
    queue: SendQueue,
}

impl<A, S, R> ConversationSync<A, S, R>
where
    A: MessagingApi,
    S: KeyStorage,
    R: RealtimeChannel,
{
    pub fn new(
        config: SyncConfig,
        queue: QueueConfig,
        api: Arc<A>,
        realtime: Arc<R>,
        vault: Arc<KeyVault<S>>,
        directory: Arc<PublicKeyDirectory<A>>,
        secrets: Arc<SharedSecretCache>,
    ) -> Self {
        let store = ConversationStore::new(vault.user_id());
        Self {
            config,
            api,
            realtime,
            vault,
            directory,
            secrets,
            store: RwLock::new(store),
            queue: SendQueue::new(queue),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn local_user_id(&self) -> &str {
        self.vault.user_id()
    }

    // ========================================================================
    // Keys and text
    // ========================================================================

    /// Conversation key for a peer, or `None` when either side has no key.
    async fn conversation_key(&self, peer_id: &str) -> Result<Option<Zeroizing<SymmetricKey>>> {
        let Some(identity) = self.vault.current().await else {
            return Ok(None);
        };
        let Some(peer_key) = self.directory.get_public_key(peer_id).await? else {
            return Ok(None);
        };
        let key = self
            .secrets
            .derive_shared_key(&identity, &peer_key, peer_id)
            .await?;
        Ok(Some(key))
    }

    /// Render text for a message. Never fails; problems become `Undecryptable`.
    async fn resolve_text(&self, peer_id: &str, message: &Message) -> MessageText {
        let (ciphertext, iv) = match message.payload() {
            Ok(Payload::Plain { text }) => return MessageText::Plain(text),
            Ok(Payload::Encrypted { ciphertext, iv }) => (ciphertext, iv),
            Err(e) => {
                debug!(id = %message.id, error = %e, "Malformed encrypted message");
                return MessageText::Undecryptable;
            }
        };

        let key = match self.conversation_key(peer_id).await {
            Ok(Some(key)) => key,
            Ok(None) => return MessageText::Undecryptable,
            Err(e) => {
                debug!(id = %message.id, peer = %peer_id, error = %e, "No conversation key");
                return MessageText::Undecryptable;
            }
        };

        match decrypt_text(&key, &ciphertext, &iv) {
            Ok(text) => MessageText::Decrypted(text),
            Err(first_error) => match self.retry_after_rotation(peer_id, &ciphertext, &iv).await {
                Some(text) => MessageText::Decrypted(text),
                None => {
                    debug!(
                        id = %message.id,
                        error = %first_error,
                        "Message could not be decrypted"
                    );
                    MessageText::Undecryptable
                }
            },
        }
    }

    /// Refetch the peer's key once; if it rotated, derive again and retry.
    async fn retry_after_rotation(
        &self,
        peer_id: &str,
        ciphertext: &str,
        iv: &str,
    ) -> Option<String> {
        let current = match self.directory.refresh_stale(peer_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return None,
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Key refresh failed");
                return None;
            }
        };
        if !self.secrets.invalidate_if_stale(peer_id, &current).await {
            return None;
        }

        let identity = self.vault.current().await?;
        let key = self
            .secrets
            .derive_shared_key(&identity, &current, peer_id)
            .await
            .ok()?;
        decrypt_text(&key, ciphertext, iv).ok()
    }

    async fn resolve_page(&self, peer_id: &str, messages: Vec<Message>) -> Vec<StoredMessage> {
        let mut page = Vec::with_capacity(messages.len());
        for message in messages {
            let text = self.resolve_text(peer_id, &message).await;
            page.push(StoredMessage::delivered(message, text));
        }
        page
    }

    /// Decrypt everything held again, e.g. after the local identity changed.
    pub async fn on_identity_changed(&self) {
        self.secrets.clear().await;
        let held = self.store.read().await.encrypted_messages();
        info!(count = held.len(), "Re-decrypting messages for new identity");

        for (peer_id, message) in held {
            let text = self.resolve_text(&peer_id, &message).await;
            self.store.write().await.set_text(&peer_id, &message.id, text);
        }
    }

    // ========================================================================
    // Conversation list
    // ========================================================================

    /// Load the first page of conversations.
    pub async fn load_conversations(&self) -> Result<PageOutcome> {
        self.fetch_conversations(true).await
    }

    /// Load the next page of conversations.
    pub async fn load_more_conversations(&self) -> Result<PageOutcome> {
        self.fetch_conversations(false).await
    }

    async fn fetch_conversations(&self, first_page: bool) -> Result<PageOutcome> {
        let ticket = self.store.write().await.begin_conversations_request(first_page);
        let limit = self.config.conversation_page_size;
        let conversations = self.api.fetch_conversations(ticket.page, limit).await?;

        let mut page = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let preview = match (
                conversation.peer_of(self.local_user_id()),
                &conversation.last_message,
            ) {
                (Some(peer_id), Some(last)) => Some(self.resolve_text(peer_id, last).await),
                _ => None,
            };
            page.push((conversation, preview));
        }

        let outcome = self
            .store
            .write()
            .await
            .apply_conversations(ticket, page, limit);
        debug!(page = ticket.page, ?outcome, "Conversation page");
        Ok(outcome)
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Make `peer_id` the viewed conversation and load its latest page.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<PageOutcome> {
        let ticket = {
            let mut store = self.store.write().await;
            store.set_active(peer_id);
            store.begin_page_request(peer_id, PageKind::Latest)
        };

        let limit = self.config.message_page_size;
        let messages = self.api.fetch_messages(peer_id, limit, None).await?;
        let page = self.resolve_page(peer_id, messages).await;
        let outcome = self.store.write().await.apply_page(&ticket, page, limit);

        if self.config.auto_mark_read && outcome != PageOutcome::Superseded {
            self.mark_read(peer_id).await;
        }
        Ok(outcome)
    }

    /// Stop viewing the current conversation.
    pub async fn close_conversation(&self) -> Option<String> {
        self.store.write().await.clear_active()
    }

    /// Load the page before the oldest loaded message.
    pub async fn load_older_messages(&self, peer_id: &str) -> Result<PageOutcome> {
        let (ticket, cursor) = {
            let mut store = self.store.write().await;
            if store.is_loaded(peer_id) && !store.has_more(peer_id) {
                return Ok(PageOutcome::Applied {
                    added: 0,
                    has_more: false,
                });
            }
            let cursor = store.oldest_cursor(peer_id);
            (store.begin_page_request(peer_id, PageKind::Older), cursor)
        };

        let limit = self.config.message_page_size;
        let messages = self
            .api
            .fetch_messages(peer_id, limit, cursor.as_deref())
            .await?;
        let page = self.resolve_page(peer_id, messages).await;
        Ok(self.store.write().await.apply_page(&ticket, page, limit))
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send text to a peer with an optimistic local insert.
    ///
    /// A failed POST is not an `Err`: the optimistic message is rolled back
    /// and the outcome is [`PendingOutcome::RolledBack`]; the plaintext stays
    /// available to [`ConversationSync::resend`].
    pub async fn send(&self, peer_id: &str, plaintext: &str) -> Result<PendingOutcome> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(SealChatError::MessageTooLarge(plaintext.len()));
        }
        let pending = self
            .queue
            .enqueue(PendingSend::new(peer_id, plaintext))
            .await?;
        Ok(self.attempt_send(pending).await)
    }

    /// Send a failed message again.
    pub async fn resend(&self, pending_id: &str) -> Result<PendingOutcome> {
        let pending = self.queue.begin_retry(pending_id).await?;
        Ok(self.attempt_send(pending).await)
    }

    /// Give up on a failed message.
    pub async fn discard_failed(&self, pending_id: &str) -> Option<PendingSend> {
        self.queue.remove(pending_id).await
    }

    pub async fn failed_sends(&self) -> Vec<PendingSend> {
        self.queue.failed().await
    }

    async fn attempt_send(&self, pending: PendingSend) -> PendingOutcome {
        let peer_id = pending.peer_id.as_str();
        let local = self.local_user_id().to_string();

        {
            let mut store = self.store.write().await;
            let conversation_id = store.conversation_id_for(peer_id).unwrap_or_default();
            let optimistic = Message::new(
                pending.id.clone(),
                conversation_id,
                local.clone(),
                Some(peer_id.to_string()),
                Payload::Plain {
                    text: pending.plaintext.clone(),
                },
                Utc::now(),
            );
            store.insert_message(
                peer_id,
                StoredMessage {
                    message: optimistic,
                    text: MessageText::Decrypted(pending.plaintext.clone()),
                    delivery: Delivery::Pending,
                },
            );
        }

        match self.deliver(peer_id, &pending.plaintext).await {
            Ok(server) => {
                self.queue.remove(&pending.id).await;
                let text = if server.is_encrypted() {
                    MessageText::Decrypted(pending.plaintext.clone())
                } else {
                    MessageText::Plain(pending.plaintext.clone())
                };

                let mut store = self.store.write().await;
                store.record_activity(&server, &text);
                let outcome = store.replace_pending(peer_id, &pending.id, server, text);
                debug!(peer = %peer_id, ?outcome, "Send acknowledged");
                outcome
            }
            Err(e) => {
                warn!(
                    peer = %peer_id,
                    pending = %pending.id,
                    error = %e,
                    "Send failed; rolled back"
                );
                if let Err(mark_err) = self.queue.mark_failed(&pending.id, &e.to_string()).await {
                    debug!(error = %mark_err, "Pending record already gone");
                }
                self.store
                    .write()
                    .await
                    .rollback_pending(peer_id, &pending.id, e)
            }
        }
    }

    /// Conversation key for an outgoing message.
    ///
    /// The peer's cached key is rechecked (throttled by the directory) so a
    /// peer that reset its keys is not encrypted to under the old one. While
    /// the local identity waits for PIN recovery nothing is sent.
    async fn outgoing_key(&self, peer_id: &str) -> Result<Option<Zeroizing<SymmetricKey>>> {
        let Some(identity) = self.vault.current().await else {
            if self.vault.is_awaiting_recovery().await {
                return Err(SealChatError::RecoveryRequired);
            }
            return Ok(None);
        };
        let Some(cached) = self.directory.get_public_key(peer_id).await? else {
            return Ok(None);
        };

        let peer_key = match self.directory.refresh_stale(peer_id).await {
            Ok(Some(current)) => {
                self.secrets.invalidate_if_stale(peer_id, &current).await;
                current
            }
            Ok(None) => {
                info!(peer = %peer_id, "Peer withdrew its public key");
                self.secrets.invalidate(peer_id).await;
                return Ok(None);
            }
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Key recheck failed; using cached key");
                cached
            }
        };

        let key = self
            .secrets
            .derive_shared_key(&identity, &peer_key, peer_id)
            .await?;
        Ok(Some(key))
    }

    /// Encrypt if both sides have keys, then POST.
    async fn deliver(&self, peer_id: &str, plaintext: &str) -> Result<Message> {
        let payload = match self.outgoing_key(peer_id).await? {
            Some(key) => Payload::from(encrypt_text(&key, plaintext)?),
            None => {
                warn!(peer = %peer_id, "No key material for peer; sending unencrypted");
                Payload::Plain {
                    text: plaintext.to_string(),
                }
            }
        };
        let request = SendMessageRequest::new(peer_id, payload);
        self.api.send_message(&request).await
    }

    // ========================================================================
    // Read state
    // ========================================================================

    /// Mark a conversation read locally, then confirm with the backend.
    ///
    /// Confirmation failures are logged; the local mark is kept.
    pub async fn mark_read(&self, peer_id: &str) {
        let Some(conversation_id) = self.store.write().await.mark_read_local(peer_id) else {
            return;
        };

        if let Err(e) = self.api.mark_read(&conversation_id).await {
            warn!(conversation = %conversation_id, error = %e, "Read confirmation failed");
        }
        let receipt = ReadReceipt {
            conversation_id: conversation_id.clone(),
            reader_id: self.local_user_id().to_string(),
        };
        if let Err(e) = self.realtime.emit(OutboundEvent::MessageRead(receipt)).await {
            warn!(conversation = %conversation_id, error = %e, "Read receipt emit failed");
        }
    }

    /// Server-side unread message count, for the initial badge.
    pub async fn server_unread_count(&self) -> Result<u64> {
        self.api.unread_count().await
    }

    // ========================================================================
    // Real-time events
    // ========================================================================

    /// Apply one inbound event.
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage(message) => self.handle_new_message(message).await,
            InboundEvent::MessageRead(receipt) => {
                let changed = self
                    .store
                    .write()
                    .await
                    .apply_read_receipt(&receipt.conversation_id, &receipt.reader_id);
                debug!(conversation = %receipt.conversation_id, changed, "Read receipt");
            }
            InboundEvent::UserOnline(user_id) => {
                self.store.write().await.set_online(&user_id, true);
            }
            InboundEvent::UserOffline(user_id) => {
                self.store.write().await.set_online(&user_id, false);
            }
            InboundEvent::OnlineUsers(users) => {
                self.store.write().await.replace_online(users);
            }
        }
    }

    async fn handle_new_message(&self, message: Message) {
        let local = self.local_user_id().to_string();
        let Some(peer_id) = message.peer_of(&local).map(str::to_string) else {
            debug!(id = %message.id, "Message without a peer ignored");
            return;
        };

        let text = self.resolve_text(&peer_id, &message).await;
        let from_peer = message.sender_id != local;

        let is_active = {
            let mut store = self.store.write().await;
            store.record_activity(&message, &text);
            let is_active = store.active_peer() == Some(peer_id.as_str());
            if is_active || store.is_loaded(&peer_id) {
                store.insert_message(&peer_id, StoredMessage::delivered(message, text));
            }
            is_active
        };

        if is_active && from_peer && self.config.auto_mark_read {
            self.mark_read(&peer_id).await;
        }
    }

    /// Apply events until the dispatcher goes away.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            self.handle_event(event).await;
        }
        debug!("Event subscription closed");
    }

    /// Ask the server for the online user list.
    pub async fn request_online_users(&self) -> Result<()> {
        self.realtime.emit(OutboundEvent::GetOnlineUsers).await
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn conversations(&self) -> Vec<ConversationEntry> {
        self.store.read().await.conversations().to_vec()
    }

    pub async fn conversations_have_more(&self) -> bool {
        self.store.read().await.conversations_have_more()
    }

    pub async fn messages(&self, peer_id: &str) -> Vec<StoredMessage> {
        self.store.read().await.messages(peer_id)
    }

    pub async fn has_more(&self, peer_id: &str) -> bool {
        self.store.read().await.has_more(peer_id)
    }

    pub async fn active_peer(&self) -> Option<String> {
        self.store.read().await.active_peer().map(str::to_string)
    }

    pub async fn is_unread(&self, peer_id: &str) -> bool {
        self.store.read().await.is_peer_unread(peer_id)
    }

    /// Unread conversations, derived from local state.
    pub async fn unread_count(&self) -> usize {
        self.store.read().await.unread_count()
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.store.read().await.online_users()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.store.read().await.is_online(user_id)
    }
}
