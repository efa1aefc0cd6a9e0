//! Hub Message Types
//!
//! Wire formats exchanged with clients and the values publishers hand to the
//! hub.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::connection::ConnectionId;

/// A message fanned out to every connection (or to a mailbox)
///
/// Serialized as `{"data": <opaque>, "topic": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque payload, passed through untouched
    #[serde(default)]
    pub data: Value,
    /// Topic the client uses to route the payload
    #[serde(default)]
    pub topic: String,
}

impl Message {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            topic: topic.into(),
        }
    }

    /// Encode the outbound envelope
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A message delivered only to the connections subscribed as `username`
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub message: Message,
    pub username: String,
}

impl MailMessage {
    pub fn new(username: impl Into<String>, message: Message) -> Self {
        Self {
            message,
            username: username.into(),
        }
    }
}

/// Subscription frame sent by a client over its socket
///
/// Field names match in any letter case (`Username`, `username`,
/// `USERNAME`), preferring an exact match. Unknown fields are ignored and
/// missing or null fields are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFrame {
    pub username: String,
    pub token: String,
}

impl<'de> Deserialize<'de> for SubscriptionFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self {
            username: frame_field::<D::Error>(&fields, "Username")?,
            token: frame_field::<D::Error>(&fields, "Token")?,
        })
    }
}

fn frame_field<E: de::Error>(fields: &Map<String, Value>, name: &str) -> Result<String, E> {
    let value = fields.get(name).or_else(|| {
        fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    });

    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(E::custom(format!("field `{}` must be a string", name))),
    }
}

impl SubscriptionFrame {
    pub fn parse(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// A decoded subscription frame tagged with the connection it arrived on
#[derive(Debug, Clone)]
pub struct Subscription {
    pub username: String,
    pub token: String,
    pub connection: ConnectionId,
}

impl Subscription {
    pub fn new(frame: SubscriptionFrame, connection: ConnectionId) -> Self {
        Self {
            username: frame.username,
            token: frame.token,
            connection,
        }
    }
}

/// Topic of the optional frame acknowledging a subscription attempt
pub const SUBSCRIPTION_ACK_TOPIC: &str = "subscription";

/// Build the acknowledgement sent back after a subscription attempt
pub fn subscription_ack(username: &str, accepted: bool) -> Message {
    Message::new(
        SUBSCRIPTION_ACK_TOPIC,
        serde_json::json!({ "username": username, "accepted": accepted }),
    )
}
