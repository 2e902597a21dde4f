//! Transport Layer
//!
//! Client-facing transports. A transport hands the hub a
//! [`ClientSink`](crate::connection::ClientSink) for outbound messages and
//! a stream of [`Inbound`] items; the stream ending means the client is gone.

mod websocket;

pub use websocket::WsSink;

/// One unit of inbound client activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text message carrying a client protocol message
    Text(String),
    /// A frame that cannot carry a protocol message
    Invalid(String),
    /// Transport-level liveness traffic (WebSocket ping/pong)
    Activity,
}
