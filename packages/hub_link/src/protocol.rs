//! JSON hub protocol: record-separated frames with an integer `type` tag.
//!
//! Wire format: `{json}\x1e{json}\x1e...`
//!
//! | type | frame       |
//! |------|-------------|
//! | 1    | Invocation  |
//! | 3    | Completion  |
//! | 6    | Ping        |
//! | 7    | Close       |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("frame has no numeric `type` field")]
    MissingType,

    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Close(CloseFrame),
    /// A well-formed frame of a kind this client does not handle (streaming).
    Other { kind: u64 },
}

fn with_type<T: Serialize>(kind: u64, body: &T) -> Value {
    let mut value = serde_json::to_value(body).unwrap_or_else(|_| Value::Object(Map::new()));
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::from(kind));
    }
    value
}

impl HubFrame {
    pub fn invocation(
        invocation_id: Option<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        HubFrame::Invocation(Invocation {
            invocation_id,
            target: target.into(),
            arguments,
        })
    }

    /// Encode as one record, separator included.
    pub fn encode(&self) -> String {
        let value = match self {
            HubFrame::Invocation(inv) => with_type(TYPE_INVOCATION, inv),
            HubFrame::Completion(c) => with_type(TYPE_COMPLETION, c),
            HubFrame::Ping => serde_json::json!({ "type": TYPE_PING }),
            HubFrame::Close(c) => with_type(TYPE_CLOSE, c),
            HubFrame::Other { kind } => serde_json::json!({ "type": kind }),
        };
        let mut out = value.to_string();
        out.push(RECORD_SEPARATOR);
        out
    }

    /// Decode a single record (without its separator).
    pub fn decode(record: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(record)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingType)?;

        fn parse<T: serde::de::DeserializeOwned>(
            value: Value,
            kind: &'static str,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                kind,
                reason: e.to_string(),
            })
        }

        Ok(match kind {
            TYPE_INVOCATION => HubFrame::Invocation(parse(value, "invocation")?),
            TYPE_COMPLETION => HubFrame::Completion(parse(value, "completion")?),
            TYPE_PING => HubFrame::Ping,
            TYPE_CLOSE => HubFrame::Close(parse(value, "close")?),
            other => HubFrame::Other { kind: other },
        })
    }
}

/// Split transport text into records, dropping the empty tail after the last separator.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

/// The first record a client sends after the transport opens.
pub fn handshake_request() -> String {
    let mut out = serde_json::json!({ "protocol": "json", "version": 1 }).to_string();
    out.push(RECORD_SEPARATOR);
    out
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Validate the server's handshake reply record.
pub fn parse_handshake_response(record: &str) -> Result<(), ProtocolError> {
    let resp: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    match resp.error {
        Some(err) => Err(ProtocolError::HandshakeRejected(err)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_wire_shape() {
        let frame = HubFrame::invocation(Some("4".into()), "JoinTopic", vec![json!(42)]);
        let text = frame.encode();
        assert!(text.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "4");
        assert_eq!(value["target"], "JoinTopic");
        assert_eq!(value["arguments"], json!([42]));
    }

    #[test]
    fn fire_and_forget_invocation_omits_id() {
        let text = HubFrame::invocation(None, "Typing", vec![]).encode();
        assert!(!text.contains("invocationId"));
    }

    #[test]
    fn decodes_server_frames() {
        let c = HubFrame::decode(r#"{"type":3,"invocationId":"9","error":"nope"}"#).unwrap();
        match c {
            HubFrame::Completion(c) => {
                assert_eq!(c.invocation_id, "9");
                assert_eq!(c.error.as_deref(), Some("nope"));
                assert!(c.result.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }

        assert_eq!(HubFrame::decode(r#"{"type":6}"#).unwrap(), HubFrame::Ping);

        let close = HubFrame::decode(r#"{"type":7,"error":"restart","allowReconnect":true}"#).unwrap();
        assert_eq!(
            close,
            HubFrame::Close(CloseFrame {
                error: Some("restart".into()),
                allow_reconnect: true
            })
        );

        assert_eq!(
            HubFrame::decode(r#"{"type":2,"item":1}"#).unwrap(),
            HubFrame::Other { kind: 2 }
        );
    }

    #[test]
    fn malformed_records() {
        assert!(matches!(
            HubFrame::decode("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            HubFrame::decode(r#"{"target":"x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert!(matches!(
            HubFrame::decode(r#"{"type":1,"arguments":[]}"#),
            Err(ProtocolError::Malformed { kind: "invocation", .. })
        ));
    }

    #[test]
    fn splits_batched_records() {
        let batch = format!(
            "{}{}",
            HubFrame::Ping.encode(),
            HubFrame::invocation(None, "ReceiveMessage", vec![]).encode()
        );
        let records: Vec<_> = split_records(&batch).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(HubFrame::decode(records[0]).unwrap(), HubFrame::Ping);
    }

    #[test]
    fn handshake() {
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert!(parse_handshake_response("{}").is_ok());
        assert_eq!(
            parse_handshake_response(r#"{"error":"unsupported protocol"}"#),
            Err(ProtocolError::HandshakeRejected("unsupported protocol".into()))
        );
    }
}
