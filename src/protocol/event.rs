//! Job events as they travel from the pub/sub transport to subscribers.

use std::time::Instant;

use serde_json::Value;

use super::DecodeError;

/// A job event in flight between the inbound bridge and the dispatcher.
///
/// Events are never stored; once fanned out they are dropped.
#[derive(Debug, Clone)]
pub struct Event {
    /// Job/task identifier the event belongs to
    pub channel_id: String,
    /// Value of the payload's `type` field
    pub kind: String,
    /// Full decoded payload, forwarded to clients unchanged
    pub payload: Value,
    /// When the event was decoded
    pub timestamp: Instant,
}

impl Event {
    /// Build an event from a payload object that already carries its `type`.
    pub fn new(channel_id: impl Into<String>, payload: Value) -> Result<Self, DecodeError> {
        let kind = match &payload {
            Value::Object(map) => map
                .get("type")
                .and_then(Value::as_str)
                .ok_or(DecodeError::MissingType)?
                .to_string(),
            _ => return Err(DecodeError::NotAnObject),
        };

        Ok(Self {
            channel_id: channel_id.into(),
            kind,
            payload,
            timestamp: Instant::now(),
        })
    }

    /// Decode a raw transport message published on `<namespace>:<channel_id>`.
    pub fn decode(namespace: &str, topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let channel_id = channel_from_topic(namespace, topic)?;
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Self::new(channel_id, value)
    }

    /// Serialize the payload into the text frame sent to subscribers
    pub fn to_text(&self) -> String {
        self.payload.to_string()
    }
}

/// Extract the channel id from a topic.
///
/// The channel id is everything after the first `:`, so channel ids may
/// themselves contain colons.
pub fn channel_from_topic<'a>(namespace: &str, topic: &'a str) -> Result<&'a str, DecodeError> {
    let (prefix, channel) = topic
        .split_once(':')
        .ok_or_else(|| DecodeError::MissingChannel(topic.to_string()))?;
    if prefix != namespace {
        return Err(DecodeError::ForeignTopic(topic.to_string()));
    }
    if channel.is_empty() {
        return Err(DecodeError::MissingChannel(topic.to_string()));
    }
    Ok(channel)
}

/// Topic a worker publishes on for the given channel
pub fn topic_for(namespace: &str, channel_id: &str) -> String {
    format!("{}:{}", namespace, channel_id)
}
