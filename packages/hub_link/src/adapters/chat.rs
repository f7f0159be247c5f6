//! Chat over the hub: typed message and typing listeners plus topic calls.
//!
//! Sender roles arrive in whatever casing and vocabulary the backend uses and
//! are folded into [`SenderRole`]; unknown roles are kept as sent.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::event::{Channel, InboundEvent, MessageEnvelope, ServerError, TypingIndicator};
use crate::manager::{ConnectionManager, ConnectionState};
use crate::registry::Subscription;
use crate::session::InvokeOutcome;

pub const SEND_TYPING: &str = "SendTypingIndicator";
pub const JOIN_TOPIC: &str = "JoinTopic";
pub const LEAVE_TOPIC: &str = "LeaveTopic";
pub const MARK_AS_READ: &str = "MarkAsRead";

/// Who sent a chat message. Unknown roles are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderRole {
    Buyer,
    Seller,
    Admin,
    Support,
    System,
    Other(String),
}

impl SenderRole {
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buyer" | "customer" | "client" => SenderRole::Buyer,
            "seller" | "vendor" | "merchant" => SenderRole::Seller,
            "admin" | "administrator" => SenderRole::Admin,
            "support" | "agent" => SenderRole::Support,
            "system" | "bot" => SenderRole::System,
            _ => SenderRole::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SenderRole::Buyer => "buyer",
            SenderRole::Seller => "seller",
            SenderRole::Admin => "admin",
            SenderRole::Support => "support",
            SenderRole::System => "system",
            SenderRole::Other(raw) => raw,
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub topic_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_role: Option<SenderRole>,
    pub content: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl From<&MessageEnvelope> for ChatMessage {
    fn from(env: &MessageEnvelope) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| env.raw.get(*k).and_then(Value::as_str))
                .map(String::from)
        };
        Self {
            id: env.id.clone(),
            topic_id: env.topic_id.clone(),
            sender_id: env.sender_id.clone(),
            sender_role: env.sender_type.as_deref().map(SenderRole::normalize),
            content: text(&["content", "text", "body"]),
            sent_at: text(&["sentAt", "createdAt"])
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            raw: env.raw.clone(),
        }
    }
}

/// Chat view of one manager: typed listeners plus best-effort outbound calls.
pub struct ChatChannel {
    manager: Arc<ConnectionManager>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChatChannel {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let errors = manager.subscribe(Channel::Error, |event| {
            if let InboundEvent::ServerError(err) = event {
                warn!(message = %err.message, code = ?err.code, "chat server error");
            }
        });
        Self {
            manager,
            subscriptions: Mutex::new(vec![errors]),
        }
    }

    fn keep(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.get_state()
    }

    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.keep(self.manager.subscribe(Channel::Message, move |event| {
            if let InboundEvent::Message(env) = event {
                listener(&ChatMessage::from(env));
            }
        }));
    }

    pub fn on_typing<F>(&self, listener: F)
    where
        F: Fn(&TypingIndicator) + Send + Sync + 'static,
    {
        self.keep(self.manager.subscribe(Channel::Typing, move |event| {
            if let InboundEvent::TypingIndicator(t) = event {
                listener(t);
            }
        }));
    }

    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&ServerError) + Send + Sync + 'static,
    {
        self.keep(self.manager.subscribe(Channel::Error, move |event| {
            if let InboundEvent::ServerError(err) = event {
                listener(err);
            }
        }));
    }

    pub async fn send_typing(
        &self,
        topic_id: impl Into<Value>,
        recipient_id: impl Into<Value>,
    ) -> InvokeOutcome {
        self.manager
            .invoke(SEND_TYPING, vec![topic_id.into(), recipient_id.into()])
            .await
    }

    pub async fn join_topic(&self, topic_id: impl Into<Value>) -> InvokeOutcome {
        self.manager.invoke(JOIN_TOPIC, vec![topic_id.into()]).await
    }

    pub async fn leave_topic(&self, topic_id: impl Into<Value>) -> InvokeOutcome {
        self.manager.invoke(LEAVE_TOPIC, vec![topic_id.into()]).await
    }

    pub async fn mark_as_read(&self, topic_id: impl Into<Value>) -> InvokeOutcome {
        self.manager.invoke(MARK_AS_READ, vec![topic_id.into()]).await
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        for subscription in self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HubTargets;
    use crate::manager::{Credential, ManagerConfig};
    use crate::session::SkipReason;
    use crate::test_helpers::{MockHub, eventually};
    use serde_json::json;
    use std::time::Duration;

    fn chat(hub: &Arc<MockHub>) -> (Arc<ConnectionManager>, ChatChannel) {
        let mut config = ManagerConfig::new("http://hub.test/hubs/chat", HubTargets::chat());
        config.liveness_probe = None;
        let manager = Arc::new(ConnectionManager::new(config, hub.clone()));
        let chat = ChatChannel::new(manager.clone());
        (manager, chat)
    }

    #[test]
    fn normalizes_roles() {
        assert_eq!(SenderRole::normalize("SELLER"), SenderRole::Seller);
        assert_eq!(SenderRole::normalize(" customer "), SenderRole::Buyer);
        assert_eq!(SenderRole::normalize("Vendor"), SenderRole::Seller);
        assert_eq!(SenderRole::normalize("bot"), SenderRole::System);
        assert_eq!(
            SenderRole::normalize("Moderator"),
            SenderRole::Other("Moderator".into())
        );
        assert_eq!(SenderRole::normalize("Moderator").to_string(), "Moderator");
    }

    #[test]
    fn message_from_envelope() {
        let env = MessageEnvelope::from_value(json!({
            "id": 9, "topicId": 42, "senderId": "u1", "senderType": "Support",
            "content": "hello", "sentAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        let msg = ChatMessage::from(&env);
        assert_eq!(msg.sender_role, Some(SenderRole::Support));
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert_eq!(msg.sent_at.unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[tokio::test(start_paused = true)]
    async fn typing_while_disconnected_is_quiet() {
        let hub = MockHub::new();
        let (_manager, chat) = chat(&hub);
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        chat.on_typing(move |_| *s.lock().unwrap() += 1);

        assert_eq!(
            chat.send_typing(42, "user-7").await,
            InvokeOutcome::Skipped(SkipReason::NotConnected)
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), 0);
        assert_eq!(hub.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn join_falls_back_when_server_lacks_it() {
        let hub = MockHub::new();
        hub.missing_method(JOIN_TOPIC);
        let (manager, chat) = chat(&hub);
        manager.set_authenticated(Some(Credential::new("jwt")));
        eventually(|| chat.state() == ConnectionState::Connected).await;

        assert!(chat.join_topic(42).await.is_skipped());
        assert!(chat.join_topic(42).await.is_skipped());
        assert_eq!(hub.invocation_count(JOIN_TOPIC), 1);

        assert!(chat.send_typing(42, "user-7").await.is_completed());
        assert_eq!(hub.invocations(SEND_TYPING), vec![vec![json!(42), json!("user-7")]]);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_typed_messages() {
        let hub = MockHub::new();
        let (manager, chat) = chat(&hub);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        chat.on_message(move |m| g.lock().unwrap().push(m.clone()));

        manager.set_authenticated(Some(Credential::new("jwt")));
        eventually(|| chat.state() == ConnectionState::Connected).await;
        hub.push(
            "ReceiveMessage",
            vec![json!({"id": 1, "topicId": 42, "senderType": "seller", "content": "ok"})],
        );
        eventually(|| got.lock().unwrap().len() == 1).await;
        assert_eq!(got.lock().unwrap()[0].sender_role, Some(SenderRole::Seller));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_releases_subscriptions() {
        let hub = MockHub::new();
        let (manager, chat) = chat(&hub);
        chat.on_message(|_| {});
        chat.on_typing(|_| {});
        assert_eq!(manager.listener_count(Channel::Message), 1);
        assert_eq!(manager.listener_count(Channel::Error), 1);

        drop(chat);
        assert_eq!(manager.listener_count(Channel::Message), 0);
        assert_eq!(manager.listener_count(Channel::Typing), 0);
        assert_eq!(manager.listener_count(Channel::Error), 0);
    }
}
