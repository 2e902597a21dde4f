//! Wire formats
//!
//! Defines the inbound job event envelope decoded from the pub/sub
//! transport and the JSON messages exchanged with client connections.

mod error;
mod event;
mod message;


pub use error::{DecodeError, ProtocolError};
pub use event::{channel_from_topic, topic_for, Event};
pub use message::{validate_channel, ClientMessage, ServerMessage};
