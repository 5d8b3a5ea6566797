//! Real-time channel events and their dispatch.
//!
//! Inbound socket frames arrive as an event name plus a JSON payload. They are
//! parsed into [`InboundEvent`] and fanned out to [`Subscription`]s. A
//! subscription unsubscribes itself when dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::Message;
use crate::types::{Result, SealChatError};

pub const NEW_MESSAGE: &str = "newMessage";
pub const MESSAGE_READ: &str = "messageRead";
pub const USER_ONLINE: &str = "userOnline";
pub const USER_OFFLINE: &str = "userOffline";
pub const GET_ONLINE_USERS: &str = "getOnlineUsers";

/// Payload of a `messageRead` event in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: String,
    #[serde(alias = "userId")]
    pub reader_id: String,
}

/// A presence payload: either a bare id or `{ "userId": .. }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserRef {
    Id(String),
    Object {
        #[serde(rename = "userId", alias = "_id")]
        user_id: String,
    },
}

impl From<UserRef> for String {
    fn from(value: UserRef) -> Self {
        match value {
            UserRef::Id(id) | UserRef::Object { user_id: id } => id,
        }
    }
}

/// Events received from the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(Message),
    MessageRead(ReadReceipt),
    UserOnline(String),
    UserOffline(String),
    /// Response to a `getOnlineUsers` request.
    OnlineUsers(Vec<String>),
}

/// Discriminant of [`InboundEvent`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageRead,
    UserOnline,
    UserOffline,
    OnlineUsers,
}

impl EventKind {
    /// Wire name of the event.
    pub fn name(self) -> &'static str {
        match self {
            Self::NewMessage => NEW_MESSAGE,
            Self::MessageRead => MESSAGE_READ,
            Self::UserOnline => USER_ONLINE,
            Self::UserOffline => USER_OFFLINE,
            Self::OnlineUsers => GET_ONLINE_USERS,
        }
    }
}

impl InboundEvent {
    /// Parse a socket frame.
    pub fn from_wire(name: &str, payload: Value) -> Result<Self> {
        let event = match name {
            NEW_MESSAGE => Self::NewMessage(serde_json::from_value(payload)?),
            MESSAGE_READ => Self::MessageRead(serde_json::from_value(payload)?),
            USER_ONLINE => Self::UserOnline(serde_json::from_value::<UserRef>(payload)?.into()),
            USER_OFFLINE => Self::UserOffline(serde_json::from_value::<UserRef>(payload)?.into()),
            GET_ONLINE_USERS => Self::OnlineUsers(
                serde_json::from_value::<Vec<UserRef>>(payload)?
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            other => return Err(SealChatError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::MessageRead(_) => EventKind::MessageRead,
            Self::UserOnline(_) => EventKind::UserOnline,
            Self::UserOffline(_) => EventKind::UserOffline,
            Self::OnlineUsers(_) => EventKind::OnlineUsers,
        }
    }
}

/// Events emitted on the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    MessageRead(ReadReceipt),
    GetOnlineUsers,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageRead(_) => MESSAGE_READ,
            Self::GetOnlineUsers => GET_ONLINE_USERS,
        }
    }

    /// JSON payload to emit with [`OutboundEvent::name`].
    pub fn payload(&self) -> Result<Value> {
        match self {
            Self::MessageRead(receipt) => Ok(serde_json::to_value(receipt)?),
            Self::GetOnlineUsers => Ok(Value::Null),
        }
    }
}

struct Subscriber {
    id: u64,
    /// `None` receives every kind.
    kinds: Option<Vec<EventKind>>,
    tx: mpsc::UnboundedSender<InboundEvent>,
}

#[derive(Default)]
struct DispatcherInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

fn lock(inner: &Mutex<DispatcherInner>) -> MutexGuard<'_, DispatcherInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans inbound events out to typed subscriptions.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given event kinds.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.register(Some(kinds.to_vec()))
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.register(None)
    }

    fn register(&self, kinds: Option<Vec<EventKind>>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, kinds, tx });

        Subscription {
            id,
            dispatcher: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Deliver an event to every matching subscriber. Returns the number of
    /// subscribers that received it.
    pub fn dispatch(&self, event: InboundEvent) -> usize {
        let kind = event.kind();
        let mut inner = lock(&self.inner);
        let mut delivered = 0;

        inner.subscribers.retain(|sub| {
            let wanted = sub.kinds.as_ref().map_or(true, |k| k.contains(&kind));
            if !wanted {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        debug!(event = kind.name(), delivered, "Dispatched event");
        delivered
    }

    /// Parse a socket frame and dispatch it.
    pub fn dispatch_raw(&self, name: &str, payload: Value) -> Result<usize> {
        let event = InboundEvent::from_wire(name, payload)?;
        Ok(self.dispatch(event))
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// A stream of inbound events. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    dispatcher: Weak<Mutex<DispatcherInner>>,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            lock(&inner).subscribers.retain(|sub| sub.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_json() -> Value {
        json!({
            "_id": "m1",
            "conversationId": "c1",
            "senderId": "bob",
            "receiverId": "alice",
            "message": "hello",
            "isEncrypted": false,
            "createdAt": "2025-03-01T10:00:00Z",
            "seenBy": []
        })
    }

    #[test]
    fn test_parse_inbound_events() {
        match InboundEvent::from_wire(NEW_MESSAGE, message_json()).unwrap() {
            InboundEvent::NewMessage(m) => {
                assert_eq!(m.id, "m1");
                assert_eq!(m.sender_id, "bob");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            InboundEvent::from_wire(MESSAGE_READ, json!({"conversationId": "c1", "userId": "bob"}))
                .unwrap(),
            InboundEvent::MessageRead(ReadReceipt {
                conversation_id: "c1".into(),
                reader_id: "bob".into()
            })
        );
        assert_eq!(
            InboundEvent::from_wire(USER_ONLINE, json!("bob")).unwrap(),
            InboundEvent::UserOnline("bob".into())
        );
        assert_eq!(
            InboundEvent::from_wire(USER_OFFLINE, json!({"userId": "bob"})).unwrap(),
            InboundEvent::UserOffline("bob".into())
        );
        assert_eq!(
            InboundEvent::from_wire(GET_ONLINE_USERS, json!(["bob", {"userId": "carol"}])).unwrap(),
            InboundEvent::OnlineUsers(vec!["bob".into(), "carol".into()])
        );
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        assert_eq!(
            InboundEvent::from_wire("typing", json!({})).unwrap_err(),
            SealChatError::UnknownEvent("typing".into())
        );
        assert!(matches!(
            InboundEvent::from_wire(NEW_MESSAGE, json!({"id": 3})),
            Err(SealChatError::Serialization(_))
        ));
    }

    #[test]
    fn test_outbound_payloads() {
        let receipt = OutboundEvent::MessageRead(ReadReceipt {
            conversation_id: "c1".into(),
            reader_id: "alice".into(),
        });
        assert_eq!(receipt.name(), "messageRead");
        assert_eq!(
            receipt.payload().unwrap(),
            json!({"conversationId": "c1", "readerId": "alice"})
        );
        assert_eq!(OutboundEvent::GetOnlineUsers.name(), "getOnlineUsers");
    }

    #[tokio::test]
    async fn test_filtered_dispatch() {
        let dispatcher = EventDispatcher::new();
        let mut messages = dispatcher.subscribe(&[EventKind::NewMessage]);
        let mut everything = dispatcher.subscribe_all();

        assert_eq!(dispatcher.dispatch(InboundEvent::UserOnline("bob".into())), 1);
        assert_eq!(dispatcher.dispatch_raw(NEW_MESSAGE, message_json()).unwrap(), 2);

        assert!(matches!(messages.recv().await, Some(InboundEvent::NewMessage(_))));
        assert!(messages.try_recv().is_none());
        assert_eq!(everything.recv().await, Some(InboundEvent::UserOnline("bob".into())));
        assert!(matches!(everything.recv().await, Some(InboundEvent::NewMessage(_))));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let dispatcher = EventDispatcher::new();
        let subscription = dispatcher.subscribe_all();
        let _other = dispatcher.subscribe(&[EventKind::MessageRead]);
        assert_eq!(dispatcher.subscriber_count(), 2);

        drop(subscription);
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert_eq!(dispatcher.dispatch(InboundEvent::UserOnline("bob".into())), 0);
    }
}
