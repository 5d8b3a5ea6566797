//! In-memory conversation and message state.
//!
//! [`ConversationStore`] holds no keys and does no I/O. Every path that
//! produces a message (optimistic send, page fetch, socket push) merges into
//! the same id-keyed thread, so a message appears at most once.

use std::collections::{BTreeSet, HashMap};

use chrono::SecondsFormat;

use crate::models::{
    Conversation, Delivery, Message, MessageText, PageOutcome, PendingOutcome, StoredMessage,
};
use crate::types::SealChatError;

/// A conversation as shown in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub peer_id: String,
    pub conversation: Conversation,
    /// Render text of `conversation.last_message`.
    pub preview: Option<MessageText>,
}

/// Which end of a thread a page request loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Latest,
    Older,
}

/// Handle for an in-flight message page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTicket {
    pub peer_id: String,
    pub kind: PageKind,
    generation: u64,
}

/// Handle for an in-flight conversation list request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationTicket {
    /// 1-based page number to fetch.
    pub page: u32,
    generation: u64,
}

#[derive(Debug, Default)]
struct Thread {
    /// Oldest first.
    messages: Vec<StoredMessage>,
    has_more: bool,
    generation: u64,
    loaded: bool,
}

impl Thread {
    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.message.id == id)
    }

    /// Insert keeping creation order. Returns false if the id was present.
    fn insert(&mut self, incoming: StoredMessage) -> bool {
        if let Some(pos) = self.position(&incoming.message.id) {
            let existing = &mut self.messages[pos];
            if existing.delivery == Delivery::Pending && incoming.delivery == Delivery::Delivered {
                let seen_by = std::mem::take(&mut existing.message.seen_by);
                *existing = incoming;
                existing.message.seen_by.extend(seen_by);
            } else {
                existing.message.seen_by.extend(incoming.message.seen_by);
            }
            return false;
        }

        let at = self
            .messages
            .partition_point(|m| m.message.created_at <= incoming.message.created_at);
        self.messages.insert(at, incoming);
        true
    }
}

/// Conversation list, per-peer threads, presence and unread state.
#[derive(Debug)]
pub struct ConversationStore {
    local_user_id: String,
    /// Most recent activity first.
    conversations: Vec<ConversationEntry>,
    conversations_has_more: bool,
    conversation_pages: u32,
    conversation_generation: u64,
    threads: HashMap<String, Thread>,
    active_peer: Option<String>,
    online_users: BTreeSet<String>,
}

impl ConversationStore {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            conversations: Vec::new(),
            conversations_has_more: false,
            conversation_pages: 0,
            conversation_generation: 0,
            threads: HashMap::new(),
            active_peer: None,
            online_users: BTreeSet::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    // ------------------------------------------------------------------
    // Conversation list
    // ------------------------------------------------------------------

    /// Start a conversation list request; `first_page` restarts paging.
    pub fn begin_conversations_request(&mut self, first_page: bool) -> ConversationTicket {
        self.conversation_generation += 1;
        let page = if first_page {
            1
        } else {
            self.conversation_pages + 1
        };
        ConversationTicket {
            page,
            generation: self.conversation_generation,
        }
    }

    /// Merge a fetched conversation page.
    pub fn apply_conversations(
        &mut self,
        ticket: ConversationTicket,
        page: Vec<(Conversation, Option<MessageText>)>,
        page_size: u32,
    ) -> PageOutcome {
        if ticket.generation != self.conversation_generation {
            return PageOutcome::Superseded;
        }

        let has_more = page.len() >= page_size as usize;
        let mut added = 0;
        for (conversation, preview) in page {
            if self.merge_conversation(conversation, preview) {
                added += 1;
            }
        }
        self.sort_conversations();

        self.conversation_pages = ticket.page;
        self.conversations_has_more = has_more;
        PageOutcome::Applied { added, has_more }
    }

    /// Returns true if the conversation was not listed before.
    fn merge_conversation(
        &mut self,
        conversation: Conversation,
        preview: Option<MessageText>,
    ) -> bool {
        let Some(peer_id) = conversation.peer_of(&self.local_user_id).map(str::to_string) else {
            return false;
        };

        match self.entry_index(&peer_id, &conversation.id) {
            Some(idx) => {
                let entry = &mut self.conversations[idx];
                if conversation.activity() >= entry.conversation.activity() {
                    entry.conversation = conversation;
                    entry.preview = preview;
                }
                false
            }
            None => {
                self.conversations.push(ConversationEntry {
                    peer_id,
                    conversation,
                    preview,
                });
                true
            }
        }
    }

    fn entry_index(&self, peer_id: &str, conversation_id: &str) -> Option<usize> {
        self.conversations
            .iter()
            .position(|e| e.peer_id == peer_id || e.conversation.id == conversation_id)
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.conversation.activity().cmp(&a.conversation.activity()));
    }

    /// Make `message` the last message of its conversation if it is the newest.
    ///
    /// Creates the conversation entry when the peer is not listed yet.
    pub fn record_activity(&mut self, message: &Message, text: &MessageText) {
        let Some(peer_id) = message.peer_of(&self.local_user_id).map(str::to_string) else {
            return;
        };

        match self.entry_index(&peer_id, &message.conversation_id) {
            Some(idx) => {
                let entry = &mut self.conversations[idx];
                let is_same = entry
                    .conversation
                    .last_message
                    .as_ref()
                    .is_some_and(|last| last.id == message.id);
                if is_same || message.created_at >= entry.conversation.activity() {
                    entry.conversation.last_message = Some(message.clone());
                    entry.conversation.updated_at =
                        entry.conversation.updated_at.max(message.created_at);
                    entry.preview = Some(text.clone());
                }
            }
            None => {
                let conversation = Conversation {
                    id: message.conversation_id.clone(),
                    participants: vec![self.local_user_id.clone(), peer_id.clone()],
                    last_message: Some(message.clone()),
                    updated_at: message.created_at,
                };
                self.conversations.push(ConversationEntry {
                    peer_id,
                    conversation,
                    preview: Some(text.clone()),
                });
            }
        }
        self.sort_conversations();
    }

    pub fn conversations(&self) -> &[ConversationEntry] {
        &self.conversations
    }

    pub fn conversations_have_more(&self) -> bool {
        self.conversations_has_more
    }

    pub fn entry(&self, peer_id: &str) -> Option<&ConversationEntry> {
        self.conversations.iter().find(|e| e.peer_id == peer_id)
    }

    /// Conversation id for a peer, from the list or from a loaded message.
    pub fn conversation_id_for(&self, peer_id: &str) -> Option<String> {
        if let Some(entry) = self.entry(peer_id) {
            return Some(entry.conversation.id.clone());
        }
        self.threads
            .get(peer_id)?
            .messages
            .iter()
            .rev()
            .find(|m| m.delivery == Delivery::Delivered)
            .map(|m| m.message.conversation_id.clone())
    }

    fn peer_for_conversation(&self, conversation_id: &str) -> Option<String> {
        if let Some(entry) = self
            .conversations
            .iter()
            .find(|e| e.conversation.id == conversation_id)
        {
            return Some(entry.peer_id.clone());
        }
        self.threads
            .iter()
            .find(|(_, t)| {
                t.messages
                    .iter()
                    .any(|m| m.message.conversation_id == conversation_id)
            })
            .map(|(peer, _)| peer.clone())
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Start a page request for a peer's thread. Any earlier request for the
    /// same thread is superseded.
    pub fn begin_page_request(&mut self, peer_id: &str, kind: PageKind) -> PageTicket {
        let thread = self.threads.entry(peer_id.to_string()).or_default();
        thread.generation += 1;
        PageTicket {
            peer_id: peer_id.to_string(),
            kind,
            generation: thread.generation,
        }
    }

    /// Merge a fetched page if its request is still the latest one.
    pub fn apply_page(
        &mut self,
        ticket: &PageTicket,
        page: Vec<StoredMessage>,
        page_size: u32,
    ) -> PageOutcome {
        let thread = self.threads.entry(ticket.peer_id.clone()).or_default();
        if thread.generation != ticket.generation {
            return PageOutcome::Superseded;
        }

        let has_more = page.len() >= page_size as usize;
        let added = page
            .into_iter()
            .map(|m| thread.insert(m))
            .filter(|inserted| *inserted)
            .count();

        if ticket.kind == PageKind::Older || !thread.loaded {
            thread.has_more = has_more;
        }
        thread.loaded = true;
        PageOutcome::Applied {
            added,
            has_more: thread.has_more,
        }
    }

    /// Insert one message into a peer's thread. Returns false for a duplicate.
    pub fn insert_message(&mut self, peer_id: &str, message: StoredMessage) -> bool {
        self.threads
            .entry(peer_id.to_string())
            .or_default()
            .insert(message)
    }

    pub fn messages(&self, peer_id: &str) -> Vec<StoredMessage> {
        self.threads
            .get(peer_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub fn contains_message(&self, peer_id: &str, message_id: &str) -> bool {
        self.threads
            .get(peer_id)
            .is_some_and(|t| t.position(message_id).is_some())
    }

    pub fn has_more(&self, peer_id: &str) -> bool {
        self.threads.get(peer_id).is_some_and(|t| t.has_more)
    }

    pub fn is_loaded(&self, peer_id: &str) -> bool {
        self.threads.get(peer_id).is_some_and(|t| t.loaded)
    }

    /// `before` cursor for the next older page: the oldest delivered message's timestamp.
    pub fn oldest_cursor(&self, peer_id: &str) -> Option<String> {
        self.threads
            .get(peer_id)?
            .messages
            .iter()
            .find(|m| m.delivery == Delivery::Delivered)
            .map(|m| {
                m.message
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
            })
    }

    /// Swap an optimistic message for the server's copy.
    pub fn replace_pending(
        &mut self,
        peer_id: &str,
        pending_id: &str,
        server: Message,
        text: MessageText,
    ) -> PendingOutcome {
        let thread = self.threads.entry(peer_id.to_string()).or_default();
        let message_id = server.id.clone();

        if thread.position(&message_id).is_some() {
            if let Some(pos) = thread.position(pending_id) {
                thread.messages.remove(pos);
            }
            return PendingOutcome::SupersededByDuplicate {
                pending_id: pending_id.to_string(),
                message_id,
            };
        }

        if let Some(pos) = thread.position(pending_id) {
            thread.messages.remove(pos);
        }
        thread.insert(StoredMessage::delivered(server, text));
        PendingOutcome::Confirmed {
            pending_id: pending_id.to_string(),
            message_id,
        }
    }

    /// Remove a failed optimistic message.
    pub fn rollback_pending(
        &mut self,
        peer_id: &str,
        pending_id: &str,
        error: SealChatError,
    ) -> PendingOutcome {
        if let Some(thread) = self.threads.get_mut(peer_id) {
            if let Some(pos) = thread.position(pending_id) {
                thread.messages.remove(pos);
            }
        }
        PendingOutcome::RolledBack {
            pending_id: pending_id.to_string(),
            error,
        }
    }

    /// Update the render text of a message wherever it is shown.
    pub fn set_text(&mut self, peer_id: &str, message_id: &str, text: MessageText) {
        if let Some(thread) = self.threads.get_mut(peer_id) {
            if let Some(pos) = thread.position(message_id) {
                thread.messages[pos].text = text.clone();
            }
        }
        for entry in self.conversations.iter_mut().filter(|e| e.peer_id == peer_id) {
            if entry
                .conversation
                .last_message
                .as_ref()
                .is_some_and(|m| m.id == message_id)
            {
                entry.preview = Some(text.clone());
            }
        }
    }

    /// Every delivered encrypted message held, with its peer.
    pub fn encrypted_messages(&self) -> Vec<(String, Message)> {
        let mut found: Vec<(String, Message)> = Vec::new();
        for (peer, thread) in &self.threads {
            for stored in &thread.messages {
                if stored.delivery == Delivery::Delivered && stored.message.is_encrypted() {
                    found.push((peer.clone(), stored.message.clone()));
                }
            }
        }
        for entry in &self.conversations {
            if let Some(last) = &entry.conversation.last_message {
                let listed = found.iter().any(|(p, m)| *p == entry.peer_id && m.id == last.id);
                if last.is_encrypted() && !listed {
                    found.push((entry.peer_id.clone(), last.clone()));
                }
            }
        }
        found
    }

    // ------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------

    /// Mark every message from `peer_id` as seen by the local user.
    ///
    /// Returns the conversation id to confirm with the backend, if known.
    pub fn mark_read_local(&mut self, peer_id: &str) -> Option<String> {
        let local = self.local_user_id.clone();
        if let Some(thread) = self.threads.get_mut(peer_id) {
            for stored in thread
                .messages
                .iter_mut()
                .filter(|m| m.message.sender_id == peer_id)
            {
                stored.message.mark_seen_by(&local);
            }
        }
        if let Some(entry) = self.conversations.iter_mut().find(|e| e.peer_id == peer_id) {
            if let Some(last) = entry.conversation.last_message.as_mut() {
                if last.sender_id != local {
                    last.mark_seen_by(&local);
                }
            }
        }
        self.conversation_id_for(peer_id)
    }

    /// Apply a read receipt: `reader_id` has seen everything the other side sent.
    pub fn apply_read_receipt(&mut self, conversation_id: &str, reader_id: &str) -> bool {
        let Some(peer_id) = self.peer_for_conversation(conversation_id) else {
            return false;
        };

        let mut changed = false;
        if let Some(thread) = self.threads.get_mut(&peer_id) {
            for stored in thread.messages.iter_mut().filter(|m| {
                m.message.conversation_id == conversation_id && m.message.sender_id != reader_id
            }) {
                changed |= stored.message.mark_seen_by(reader_id);
            }
        }
        if let Some(entry) = self.conversations.iter_mut().find(|e| e.peer_id == peer_id) {
            if let Some(last) = entry.conversation.last_message.as_mut() {
                if last.sender_id != reader_id {
                    changed |= last.mark_seen_by(reader_id);
                }
            }
        }
        changed
    }

    /// Unread iff the last message is from the peer, not yet seen by the
    /// local user, and the conversation is not the one being viewed.
    pub fn is_unread(&self, entry: &ConversationEntry) -> bool {
        if self.active_peer.as_deref() == Some(entry.peer_id.as_str()) {
            return false;
        }
        entry
            .conversation
            .last_message
            .as_ref()
            .is_some_and(|last| {
                last.sender_id != self.local_user_id && !last.is_seen_by(&self.local_user_id)
            })
    }

    pub fn is_peer_unread(&self, peer_id: &str) -> bool {
        self.entry(peer_id).is_some_and(|e| self.is_unread(e))
    }

    /// Number of unread conversations.
    pub fn unread_count(&self) -> usize {
        self.conversations
            .iter()
            .filter(|e| self.is_unread(e))
            .count()
    }

    // ------------------------------------------------------------------
    // Active conversation and presence
    // ------------------------------------------------------------------

    pub fn set_active(&mut self, peer_id: &str) {
        self.active_peer = Some(peer_id.to_string());
    }

    pub fn clear_active(&mut self) -> Option<String> {
        self.active_peer.take()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    pub fn set_online(&mut self, user_id: &str, online: bool) {
        if online {
            self.online_users.insert(user_id.to_string());
        } else {
            self.online_users.remove(user_id);
        }
    }

    pub fn replace_online(&mut self, users: Vec<String>) {
        self.online_users = users.into_iter().collect();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online_users.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.online_users.iter().cloned().collect()
    }
}
