//! Protocol envelopes.
//!
//! A [`Message`] is the unit exchanged with the server. Its payload is either
//! a JSON value or raw bytes; the codec picks the text or binary encoding
//! from the payload variant.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON payload, sent as a text frame.
    Json(Value),
    /// Raw bytes, sent as a binary frame.
    Binary(Bytes),
    /// A reply decoded from a binary reply frame.
    BinaryReply {
        /// Reply status (`ok`, `error`, ...).
        status: String,
        /// Raw response bytes.
        response: Bytes,
    },
}

impl Payload {
    /// An empty JSON object.
    #[must_use]
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Map::new()))
    }

    /// Whether this payload travels in a binary frame.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        !matches!(self, Payload::Json(_))
    }

    /// The JSON value, if this is a JSON payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The raw bytes, if this is a binary payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            Payload::BinaryReply { response, .. } => Some(response),
            Payload::Json(_) => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the join attempt this message belongs to.
    pub join_ref: Option<String>,
    /// Request ref, used to correlate replies.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Message payload.
    pub payload: Payload,
}

impl Message {
    /// Create a message with no refs.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload: payload.into(),
        }
    }

    /// Set the request ref.
    #[must_use]
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Set the join ref.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }
}

/// Status of a reply delivered to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The server accepted the request.
    Ok,
    /// The server rejected the request.
    Error,
    /// No reply arrived in time. Only ever synthesized locally.
    Timeout,
}

impl ReplyStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply to a request, split into status and response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply status as sent by the server.
    pub status: String,
    /// Reply body.
    pub response: Payload,
}

impl Reply {
    /// Build a reply with a JSON response.
    #[must_use]
    pub fn new(status: ReplyStatus, response: Value) -> Self {
        Self {
            status: status.as_str().to_string(),
            response: Payload::Json(response),
        }
    }

    /// Extract a reply from a `phx_reply` payload.
    ///
    /// JSON payloads must be objects with a string `status`; a missing
    /// `response` becomes an empty object.
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Json(Value::Object(map)) => {
                let status = map.get("status")?.as_str()?.to_string();
                let response = map
                    .get("response")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                Some(Self {
                    status,
                    response: Payload::Json(response),
                })
            }
            Payload::BinaryReply { status, response } => Some(Self {
                status: status.clone(),
                response: Payload::Binary(response.clone()),
            }),
            _ => None,
        }
    }

    /// Whether this reply carries `status`.
    #[must_use]
    pub fn is(&self, status: ReplyStatus) -> bool {
        self.status == status.as_str()
    }

    /// Convert back into a `phx_reply` payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        match self.response {
            Payload::Json(response) => Payload::Json(serde_json::json!({
                "status": self.status,
                "response": response,
            })),
            Payload::Binary(response) | Payload::BinaryReply { response, .. } => {
                Payload::BinaryReply {
                    status: self.status,
                    response,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let msg = Message::new("room:lobby", "new_msg", json!({"body": "hi"}))
            .with_ref("3")
            .with_join_ref("1");

        assert_eq!(msg.topic, "room:lobby");
        assert_eq!(msg.msg_ref.as_deref(), Some("3"));
        assert_eq!(msg.join_ref.as_deref(), Some("1"));
        assert!(!msg.payload.is_binary());
    }

    #[test]
    fn test_reply_from_json_payload() {
        let payload = Payload::Json(json!({"status": "ok", "response": {"id": 7}}));
        let reply = Reply::from_payload(&payload).unwrap();
        assert!(reply.is(ReplyStatus::Ok));
        assert_eq!(reply.response, Payload::Json(json!({"id": 7})));

        let no_response = Payload::Json(json!({"status": "error"}));
        let reply = Reply::from_payload(&no_response).unwrap();
        assert!(reply.is(ReplyStatus::Error));
        assert_eq!(reply.response, Payload::empty());
    }

    #[test]
    fn test_reply_from_binary_payload() {
        let payload = Payload::BinaryReply {
            status: "ok".into(),
            response: Bytes::from_static(&[1, 2]),
        };
        let reply = Reply::from_payload(&payload).unwrap();
        assert!(reply.is(ReplyStatus::Ok));
        assert_eq!(reply.response, Payload::Binary(Bytes::from_static(&[1, 2])));
        assert_eq!(reply.into_payload(), payload);
    }

    #[test]
    fn test_reply_rejects_malformed() {
        assert!(Reply::from_payload(&Payload::Json(json!("ok"))).is_none());
        assert!(Reply::from_payload(&Payload::Json(json!({"status": 1}))).is_none());
        assert!(Reply::from_payload(&Payload::Binary(Bytes::new())).is_none());
    }
}
