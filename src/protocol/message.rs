//! Client protocol messages.
//!
//! Client → server: `subscribe`, `unsubscribe`, `pong` (plus the
//! `join_channel` / `leave_channel` aliases keyed by `job_id`).
//! Server → client: `subscribed`, `unsubscribed`, `error`, `ping`, and
//! forwarded job events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// Message types a client may send
const CLIENT_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "join_channel",
    "leave_channel",
    "pong",
];

/// Message received from a client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events for a channel
    #[serde(alias = "join_channel")]
    Subscribe {
        #[serde(alias = "job_id")]
        channel: String,
    },
    /// Stop receiving events for a channel
    #[serde(alias = "leave_channel")]
    Unsubscribe {
        #[serde(alias = "job_id")]
        channel: String,
    },
    /// Answer to a server ping
    Pong,
}

impl ClientMessage {
    /// Parse a text frame from a client
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }
}

/// Control message sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription acknowledged
    Subscribed { channel: String },
    /// Unsubscription acknowledged
    Unsubscribed { channel: String },
    /// Client message rejected
    Error { message: String },
    /// Liveness probe; the client answers with `pong`
    Ping,
}

impl ServerMessage {
    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    /// Serialize into a text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Check a channel id requested by a client.
pub fn validate_channel(channel: &str, max_len: usize) -> Result<(), ProtocolError> {
    if channel.is_empty() {
        return Err(ProtocolError::InvalidChannel(
            "channel cannot be empty".to_string(),
        ));
    }
    if channel.len() > max_len {
        return Err(ProtocolError::InvalidChannel(format!(
            "channel exceeds {} bytes",
            max_len
        )));
    }
    if channel.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidChannel(
            "channel contains control characters".to_string(),
        ));
    }
    Ok(())
}
