//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use sealchat::{
    Conversation, InMemoryKeyStorage, KdfParams, Message, MessagingApi, OutboundEvent, Payload,
    RealtimeChannel, RecoveryBackup, Result, SealChat, SealChatConfig, SealChatError,
    SendMessageRequest,
};
use tokio::sync::Notify;

pub type Client = SealChat<UserApi, InMemoryKeyStorage, RecordingChannel>;

#[derive(Default)]
struct ServerState {
    public_keys: HashMap<String, String>,
    messages: Vec<Message>,
    backups: HashMap<String, RecoveryBackup>,
    read_calls: Vec<(String, String)>,
}

/// A fake messaging backend holding every user's data.
#[derive(Default)]
pub struct Server {
    state: Mutex<ServerState>,
    next_id: AtomicUsize,
    offline: AtomicBool,
    fail_sends: AtomicBool,
    send_gate: Mutex<Option<Arc<Notify>>>,
    pub backup_calls: AtomicUsize,
    pub key_fetches: AtomicUsize,
}

pub fn conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("conv-{}-{}", first, second)
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn api(self: &Arc<Self>, user_id: &str) -> Arc<UserApi> {
        Arc::new(UserApi {
            server: self.clone(),
            user_id: user_id.to_string(),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make the next sends wait after storing until the returned gate is notified.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SealChatError::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn store_message(&self, sender: &str, receiver: &str, payload: Payload) -> Message {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Message::new(
            format!("m{}", n),
            conversation_id(sender, receiver),
            sender,
            Some(receiver.to_string()),
            payload,
            epoch() + Duration::seconds(n as i64),
        );
        self.state.lock().unwrap().messages.push(message.clone());
        message
    }

    /// Store a plain message directly, bypassing any client.
    pub fn seed_plain(&self, sender: &str, receiver: &str, text: &str) -> Message {
        self.store_message(
            sender,
            receiver,
            Payload::Plain {
                text: text.to_string(),
            },
        )
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.state.lock().unwrap().messages.last().cloned()
    }

    /// Wait until at least `count` messages are stored.
    pub async fn wait_for_messages(&self, count: usize) -> Message {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.messages.len() >= count {
                    return state.messages[count - 1].clone();
                }
            }
            tokio::task::yield_now().await;
        }
    }

    pub fn published_key(&self, user_id: &str) -> Option<String> {
        self.state.lock().unwrap().public_keys.get(user_id).cloned()
    }

    pub fn backup(&self, user_id: &str) -> Option<RecoveryBackup> {
        self.state.lock().unwrap().backups.get(user_id).cloned()
    }

    pub fn read_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().read_calls.clone()
    }
}

/// One user's authenticated view of the [`Server`].
pub struct UserApi {
    server: Arc<Server>,
    user_id: String,
}

#[async_trait::async_trait]
impl MessagingApi for UserApi {
    async fn publish_public_key(&self, public_key: &str) -> Result<()> {
        self.server.check_online()?;
        let mut state = self.server.state.lock().unwrap();
        state
            .public_keys
            .insert(self.user_id.clone(), public_key.to_string());
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<String>> {
        self.server.check_online()?;
        self.server.key_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.published_key(user_id))
    }

    async fn fetch_conversations(&self, page: u32, limit: u32) -> Result<Vec<Conversation>> {
        self.server.check_online()?;
        let state = self.server.state.lock().unwrap();

        let mut by_id: HashMap<String, Conversation> = HashMap::new();
        for message in state.messages.iter().filter(|m| {
            m.sender_id == self.user_id || m.receiver_id.as_deref() == Some(self.user_id.as_str())
        }) {
            let peer = message.peer_of(&self.user_id).unwrap_or_default().to_string();
            let entry = by_id
                .entry(message.conversation_id.clone())
                .or_insert_with(|| Conversation {
                    id: message.conversation_id.clone(),
                    participants: vec![self.user_id.clone(), peer],
                    last_message: None,
                    updated_at: message.created_at,
                });
            entry.updated_at = message.created_at;
            entry.last_message = Some(message.clone());
        }

        let mut conversations: Vec<_> = by_id.into_values().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations
            .into_iter()
            .skip(((page.max(1) - 1) * limit) as usize)
            .take(limit as usize)
            .collect())
    }

    async fn fetch_messages(
        &self,
        peer_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.server.check_online()?;
        let before = before
            .map(|b| DateTime::parse_from_rfc3339(b).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| SealChatError::Network(format!("bad cursor: {}", e)))?;
        let conversation = conversation_id(&self.user_id, peer_id);

        let state = self.server.state.lock().unwrap();
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .cloned()
            .collect();
        // Newest first, like the real backend.
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        self.server.check_online()?;
        if self.server.fail_sends.load(Ordering::SeqCst) {
            return Err(SealChatError::Network("503 service unavailable".into()));
        }

        let payload = if request.is_encrypted {
            Payload::Encrypted {
                ciphertext: request.message.clone(),
                iv: request.iv.clone().unwrap_or_default(),
            }
        } else {
            Payload::Plain {
                text: request.message.clone(),
            }
        };
        let message = self
            .server
            .store_message(&self.user_id, &request.receiver_id, payload);

        let gate = self.server.send_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.server.check_online()?;
        let mut state = self.server.state.lock().unwrap();
        state
            .read_calls
            .push((self.user_id.clone(), conversation_id.to_string()));
        let user = self.user_id.clone();
        for message in state
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.sender_id != user)
        {
            message.mark_seen_by(&user);
        }
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64> {
        self.server.check_online()?;
        let state = self.server.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|m| m.receiver_id.as_deref() == Some(self.user_id.as_str()))
            .filter(|m| !m.is_seen_by(&self.user_id))
            .count() as u64)
    }

    async fn fetch_recovery_backup(&self) -> Result<Option<RecoveryBackup>> {
        self.server.check_online()?;
        self.server.backup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.backup(&self.user_id))
    }

    async fn store_recovery_backup(&self, backup: &RecoveryBackup) -> Result<()> {
        self.server.check_online()?;
        self.server.backup_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.server.state.lock().unwrap();
        state.backups.insert(self.user_id.clone(), backup.clone());
        Ok(())
    }

    async fn delete_recovery_backup(&self) -> Result<()> {
        self.server.check_online()?;
        self.server.backup_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.server.state.lock().unwrap();
        state.backups.remove(&self.user_id);
        Ok(())
    }
}

/// Records every outbound socket emit.
#[derive(Default)]
pub struct RecordingChannel {
    emitted: Mutex<Vec<OutboundEvent>>,
}

impl RecordingChannel {
    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.emitted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RealtimeChannel for RecordingChannel {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }
}

/// Argon2 parameters small enough for tests.
pub fn test_kdf() -> KdfParams {
    KdfParams::argon2id(256, 1, 1)
}

pub fn config(user_id: &str) -> SealChatConfig {
    SealChatConfig::localhost(user_id)
        .with_kdf(test_kdf())
        .with_key_refresh_interval(std::time::Duration::ZERO)
}

/// A client for `user_id` with fresh in-memory key storage.
pub fn client(server: &Arc<Server>, user_id: &str) -> (Client, Arc<RecordingChannel>) {
    client_with(server, user_id, config(user_id))
}

pub fn client_with(
    server: &Arc<Server>,
    user_id: &str,
    config: SealChatConfig,
) -> (Client, Arc<RecordingChannel>) {
    let channel = Arc::new(RecordingChannel::default());
    let client = SealChat::new(
        config,
        server.api(user_id),
        InMemoryKeyStorage::new(),
        channel.clone(),
    );
    (client, channel)
}

/// Deliver a stored message to a client as a `newMessage` push.
pub async fn push(client: &Client, message: &Message) {
    client
        .handle_socket_event("newMessage", serde_json::to_value(message).unwrap())
        .await
        .unwrap();
}
