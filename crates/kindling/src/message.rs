//! The multiplexed message record and its payload forms.
//!
//! Every frame exchanged with the server decodes to a [`Message`]: a topic,
//! an event name, two optional correlation refs, and a payload. A message is
//! either an *object message* (structured JSON payload) or a *binary message*
//! (opaque byte payload), never both.

use serde_json::{json, Value};
use std::sync::Arc;

/// Reserved protocol event names.
pub mod events {
    /// Sent to join a channel topic.
    pub const JOIN: &str = "phx_join";
    /// Sent to leave a channel topic.
    pub const LEAVE: &str = "phx_leave";
    /// Server reply correlated to a previous push by ref.
    pub const REPLY: &str = "phx_reply";
    /// Server notification that a channel closed.
    pub const CLOSE: &str = "phx_close";
    /// Server notification that a channel errored.
    pub const ERROR: &str = "phx_error";
    /// Connection keep-alive, sent on the system topic.
    pub const HEARTBEAT: &str = "heartbeat";

    /// Whether an event participates in the channel lifecycle, and is
    /// therefore dropped when it carries an outdated join ref.
    pub fn is_lifecycle(event: &str) -> bool {
        matches!(event, CLOSE | ERROR | JOIN | REPLY | LEAVE)
    }
}

/// The system-reserved topic heartbeats are exchanged on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// A raw frame as sent to or received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

/// A message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured payload of an object message.
    Json(Value),
    /// Opaque payload of a binary message.
    Binary(Vec<u8>),
    /// Reply synthesized while decoding the binary sub-protocol: the reply
    /// status plus the raw response bytes. Inbound only.
    BinaryReply {
        /// The reply status string.
        status: String,
        /// The raw response bytes.
        response: Vec<u8>,
    },
}

impl Payload {
    /// View this payload as a reply, if it has the `{status, response}` shape.
    pub fn as_reply(&self) -> Option<Reply> {
        match self {
            Payload::Json(Value::Object(map)) => {
                let status = map.get("status")?.as_str()?.to_string();
                let response = map.get("response").cloned().unwrap_or(Value::Null);
                Some(Reply {
                    status,
                    response: Payload::Json(response),
                })
            }
            Payload::BinaryReply { status, response } => Some(Reply {
                status: status.clone(),
                response: Payload::Binary(response.clone()),
            }),
            _ => None,
        }
    }

    /// Whether this is the payload of a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// The structured value of an object message payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// A reply to a push, matched by ref.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The status string the server replied with (`ok`, `error`, `timeout`,
    /// or any caller-defined status).
    pub status: String,
    /// The response payload.
    pub response: Payload,
}

impl Reply {
    /// Re-wrap this reply as the payload of a reply event.
    pub fn into_payload(self) -> Payload {
        match self.response {
            Payload::Json(value) => Payload::Json(json!({
                "status": self.status,
                "response": value,
            })),
            Payload::Binary(bytes) | Payload::BinaryReply { response: bytes, .. } => {
                Payload::BinaryReply {
                    status: self.status,
                    response: bytes,
                }
            }
        }
    }
}

/// A zero-argument provider re-invoked at send time, so payloads and join
/// params can reflect state changes between creation and transmission.
pub type PayloadProvider = Arc<dyn Fn() -> Payload + Send + Sync>;

/// Wrap a fixed payload in a provider.
pub fn payload_provider(payload: Payload) -> PayloadProvider {
    Arc::new(move || payload.clone())
}

/// The unit exchanged on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identifies the join generation this message belongs to; `None` for
    /// broadcasts.
    pub join_ref: Option<String>,
    /// Correlates a request to its reply; `None` for pushes that expect no
    /// reply.
    pub msg_ref: Option<String>,
    /// The channel topic.
    pub topic: String,
    /// The event name.
    pub event: String,
    /// The payload.
    pub payload: Payload,
}

impl Message {
    /// Build a heartbeat message for the system topic.
    pub fn heartbeat(msg_ref: String) -> Message {
        Message {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: HEARTBEAT_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: Payload::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_view_of_json_payload() {
        let payload = Payload::Json(json!({"status": "ok", "response": {"id": 1}}));
        let reply = payload.as_reply().unwrap();
        assert_eq!(reply.status, "ok");
        assert_eq!(reply.response, Payload::Json(json!({"id": 1})));
    }

    #[test]
    fn reply_view_of_binary_reply_payload() {
        let payload = Payload::BinaryReply {
            status: "error".into(),
            response: vec![1, 2, 3],
        };
        let reply = payload.as_reply().unwrap();
        assert_eq!(reply.status, "error");
        assert_eq!(reply.response, Payload::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn non_reply_payloads_have_no_reply_view() {
        assert!(Payload::Json(json!({"noise": true})).as_reply().is_none());
        assert!(Payload::Binary(vec![0]).as_reply().is_none());
    }

    #[test]
    fn reply_round_trips_through_payload() {
        let reply = Reply {
            status: "ok".into(),
            response: Payload::Json(json!({"n": 2})),
        };
        assert_eq!(reply.clone().into_payload().as_reply().unwrap(), reply);
    }
}
