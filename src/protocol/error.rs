//! Protocol error types

use std::fmt;

/// Errors that can occur while decoding an inbound job event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Topic does not belong to the configured namespace
    ForeignTopic(String),
    /// Topic carries no channel identifier after the namespace
    MissingChannel(String),
    /// Payload is not valid UTF-8
    InvalidUtf8,
    /// Payload is not valid JSON
    InvalidJson(String),
    /// Payload is not a JSON object
    NotAnObject,
    /// Payload has no string `type` discriminator
    MissingType,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignTopic(topic) => write!(f, "topic '{}' is outside the namespace", topic),
            Self::MissingChannel(topic) => write!(f, "topic '{}' has no channel id", topic),
            Self::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            Self::InvalidJson(e) => write!(f, "payload is not valid JSON: {}", e),
            Self::NotAnObject => write!(f, "payload is not a JSON object"),
            Self::MissingType => write!(f, "payload has no string 'type' field"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors in messages received from a client connection.
///
/// These are reported back to the offending client as an `error` message;
/// the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message is not valid JSON
    InvalidJson(String),
    /// Message has no string `type` field
    MissingType,
    /// Message type is not part of the client protocol
    UnknownType(String),
    /// Known message type with missing or mistyped fields
    Malformed { kind: String, reason: String },
    /// Channel identifier rejected
    InvalidChannel(String),
    /// Connection reached its subscription limit
    TooManySubscriptions(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            Self::MissingType => write!(f, "message has no 'type' field"),
            Self::UnknownType(kind) => write!(f, "unknown message type '{}'", kind),
            Self::Malformed { kind, reason } => write!(f, "malformed '{}' message: {}", kind, reason),
            Self::InvalidChannel(reason) => write!(f, "invalid channel: {}", reason),
            Self::TooManySubscriptions(limit) => {
                write!(f, "subscription limit of {} channels reached", limit)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
