//! Inbound event envelopes and the mapping from hub targets to channels.
//!
//! Only the envelope matters here: ids, topic, sender. Feature adapters decode
//! the rest of the payload from [`MessageEnvelope::raw`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::protocol::ProtocolError;

/// Fan-out channels of the subscriber registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Message,
    Typing,
    Error,
}

/// Ids arrive as strings or numbers depending on the backend entity.
pub(crate) fn id_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

pub(crate) fn opt_id_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeFields {
    #[serde(deserialize_with = "id_from_any")]
    id: String,
    #[serde(default, alias = "conversationId", deserialize_with = "opt_id_from_any")]
    topic_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_from_any")]
    sender_id: Option<String>,
    #[serde(default, alias = "senderRole")]
    sender_type: Option<String>,
}

/// A pushed item (chat message, notification) with its raw payload kept intact.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub id: String,
    pub topic_id: Option<String>,
    pub sender_id: Option<String>,
    /// Sender role exactly as the server sent it; adapters normalize it.
    pub sender_type: Option<String>,
    pub raw: Value,
}

impl MessageEnvelope {
    pub fn from_value(raw: Value) -> Result<Self, ProtocolError> {
        let fields: EnvelopeFields =
            serde_json::from_value(raw.clone()).map_err(|e| ProtocolError::Malformed {
                kind: "message",
                reason: e.to_string(),
            })?;
        Ok(Self {
            id: fields.id,
            topic_id: fields.topic_id,
            sender_id: fields.sender_id,
            sender_type: fields.sender_type,
            raw,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    #[serde(alias = "conversationId", deserialize_with = "id_from_any")]
    pub topic_id: String,
    #[serde(deserialize_with = "id_from_any")]
    pub sender_id: String,
    #[serde(default, alias = "senderDisplayName")]
    pub sender_name: String,
}

impl TypingIndicator {
    /// Accepts one object argument or `(topicId, senderId, senderName)` positionally.
    pub fn from_arguments(arguments: &[Value]) -> Result<Self, ProtocolError> {
        let malformed = |reason: String| ProtocolError::Malformed {
            kind: "typing",
            reason,
        };
        match arguments {
            [obj @ Value::Object(_)] => {
                serde_json::from_value(obj.clone()).map_err(|e| malformed(e.to_string()))
            }
            [topic, sender, rest @ ..] => {
                let id = |v: &Value| match v {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(malformed(format!("bad id {other}"))),
                };
                Ok(Self {
                    topic_id: id(topic)?,
                    sender_id: id(sender)?,
                    sender_name: rest
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            _ => Err(malformed(format!("{} arguments", arguments.len()))),
        }
    }
}

/// Application-level error reported by the server, or a frame we could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn from_arguments(arguments: &[Value]) -> Self {
        match arguments.first() {
            Some(Value::String(s)) => Self::new(s.clone()),
            Some(obj @ Value::Object(_)) => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| obj.to_string());
                let code = obj.get("code").and_then(Value::as_str).map(String::from);
                Self { message, code }
            }
            Some(other) => Self::new(other.to_string()),
            None => Self::new("unspecified server error"),
        }
    }

    pub fn malformed(target: &str, err: &ProtocolError) -> Self {
        Self {
            message: format!("{target}: {err}"),
            code: Some("malformed_event".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(MessageEnvelope),
    TypingIndicator(TypingIndicator),
    ServerError(ServerError),
}

impl InboundEvent {
    pub fn channel(&self) -> Channel {
        match self {
            InboundEvent::Message(_) => Channel::Message,
            InboundEvent::TypingIndicator(_) => Channel::Typing,
            InboundEvent::ServerError(_) => Channel::Error,
        }
    }
}

/// Server invocation targets feeding each channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubTargets {
    pub message: String,
    #[serde(default)]
    pub typing: Option<String>,
    pub error: String,
}

impl HubTargets {
    pub fn chat() -> Self {
        Self {
            message: "ReceiveMessage".to_string(),
            typing: Some("UserTyping".to_string()),
            error: "ReceiveError".to_string(),
        }
    }

    pub fn notifications() -> Self {
        Self {
            message: "ReceiveNotification".to_string(),
            typing: None,
            error: "ReceiveError".to_string(),
        }
    }

    pub fn channel_for(&self, target: &str) -> Option<Channel> {
        if target.eq_ignore_ascii_case(&self.message) {
            Some(Channel::Message)
        } else if self
            .typing
            .as_deref()
            .is_some_and(|t| target.eq_ignore_ascii_case(t))
        {
            Some(Channel::Typing)
        } else if target.eq_ignore_ascii_case(&self.error) {
            Some(Channel::Error)
        } else {
            None
        }
    }

    /// Every target that gets an inbound handler.
    pub fn targets(&self) -> Vec<&str> {
        let mut out = vec![self.message.as_str(), self.error.as_str()];
        if let Some(t) = &self.typing {
            out.push(t);
        }
        out
    }

    /// Decode one server invocation. A payload that does not fit its channel
    /// becomes a `ServerError` rather than being dropped.
    pub fn decode(&self, target: &str, arguments: &[Value]) -> Option<InboundEvent> {
        let event = match self.channel_for(target)? {
            Channel::Message => match arguments.first() {
                Some(raw) => MessageEnvelope::from_value(raw.clone())
                    .map(InboundEvent::Message)
                    .unwrap_or_else(|e| InboundEvent::ServerError(ServerError::malformed(target, &e))),
                None => InboundEvent::ServerError(ServerError::malformed(
                    target,
                    &ProtocolError::Malformed {
                        kind: "message",
                        reason: "no arguments".into(),
                    },
                )),
            },
            Channel::Typing => TypingIndicator::from_arguments(arguments)
                .map(InboundEvent::TypingIndicator)
                .unwrap_or_else(|e| InboundEvent::ServerError(ServerError::malformed(target, &e))),
            Channel::Error => InboundEvent::ServerError(ServerError::from_arguments(arguments)),
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_accepts_numeric_ids_and_aliases() {
        let env = MessageEnvelope::from_value(json!({
            "id": 17, "conversationId": 42, "senderId": "user-7",
            "senderRole": "SELLER", "content": "hi"
        }))
        .unwrap();
        assert_eq!(env.id, "17");
        assert_eq!(env.topic_id.as_deref(), Some("42"));
        assert_eq!(env.sender_id.as_deref(), Some("user-7"));
        assert_eq!(env.sender_type.as_deref(), Some("SELLER"));
        assert_eq!(env.raw["content"], "hi");
    }

    #[test]
    fn envelope_requires_id() {
        assert!(MessageEnvelope::from_value(json!({ "topicId": 1 })).is_err());
    }

    #[test]
    fn typing_object_and_positional() {
        let a = TypingIndicator::from_arguments(&[json!({
            "topicId": 42, "senderId": "user-7", "senderName": "Ada"
        })])
        .unwrap();
        let b = TypingIndicator::from_arguments(&[json!(42), json!("user-7"), json!("Ada")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.topic_id, "42");

        assert!(TypingIndicator::from_arguments(&[]).is_err());
    }

    #[test]
    fn server_error_shapes() {
        assert_eq!(
            ServerError::from_arguments(&[json!("boom")]),
            ServerError::new("boom")
        );
        let e = ServerError::from_arguments(&[json!({"message": "denied", "code": "forbidden"})]);
        assert_eq!(e.code.as_deref(), Some("forbidden"));
    }

    #[test]
    fn routes_targets_case_insensitively() {
        let t = HubTargets::chat();
        assert_eq!(t.channel_for("receivemessage"), Some(Channel::Message));
        assert_eq!(t.channel_for("UserTyping"), Some(Channel::Typing));
        assert_eq!(t.channel_for("Unknown"), None);
        assert_eq!(HubTargets::notifications().channel_for("UserTyping"), None);
    }

    #[test]
    fn malformed_message_goes_to_error_channel() {
        let t = HubTargets::chat();
        let ev = t.decode("ReceiveMessage", &[json!("not an object")]).unwrap();
        match ev {
            InboundEvent::ServerError(e) => {
                assert_eq!(e.code.as_deref(), Some("malformed_event"));
                assert!(e.message.starts_with("ReceiveMessage"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(ev_channel(&t, "ReceiveMessage", json!({"id": 1})), Channel::Message);
    }

    fn ev_channel(t: &HubTargets, target: &str, arg: Value) -> Channel {
        t.decode(target, &[arg]).unwrap().channel()
    }
}
