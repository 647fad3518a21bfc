use serde::Serialize;
use serde_json::Value;

/// Errors raised while decoding an inbound payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A decoded message received on one of the subscribed topics.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    topic: String,
    payload: Value,
}

impl InboundMessage {
    pub fn decode(topic: impl Into<String>, raw: &[u8]) -> Result<Self, PayloadError> {
        let payload = serde_json::from_slice(raw)?;
        Ok(Self {
            topic: topic.into(),
            payload,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Logical event key used for deduplication.
    pub fn event_id(&self) -> Option<String> {
        self.identifier("eventId")
    }

    /// Per-delivery identifier, kept for diagnostics only.
    pub fn message_id(&self) -> Option<String> {
        self.identifier("messageId")
    }

    // Empty strings, zero, false and null count as absent. Any other value
    // is an identifier; arrays and objects key on their compact JSON text.
    fn identifier(&self, field: &str) -> Option<String> {
        match self.payload.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            Value::Bool(true) => Some("true".to_string()),
            value @ (Value::Array(_) | Value::Object(_)) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn into_forwarded(self) -> ForwardedMessage {
        ForwardedMessage {
            topic: self.topic,
            payload: self.payload,
        }
    }
}

/// What the downstream consumer receives for every non-duplicate message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForwardedMessage {
    pub topic: String,
    pub payload: Value,
}
