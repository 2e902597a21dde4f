//! Pub/Sub Transport
//!
//! Abstraction over the external publish/subscribe system that workers
//! publish job events onto. The inbound bridge holds exactly one pattern
//! subscription; workers (or the [`EventPublisher`] helper) publish to
//! `<namespace>:<channel_id>`.
//!
//! Implementations:
//! - [`RedisTransport`]: Redis `PSUBSCRIBE` / `PUBLISH`
//! - [`MemoryTransport`]: in-process, used when embedding and in tests

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::config::{PubSubBackend, PubSubConfig};
use crate::protocol::topic_for;

mod memory;
mod redis;


pub use self::memory::MemoryTransport;
pub use self::redis::RedisTransport;

/// Error type for pub/sub transport operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish the transport connection
    Connect(String),
    /// Established connection failed
    ConnectionLost(String),
    /// Operation timed out
    Timeout,
    /// Payload could not be serialized
    Encode(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::Encode(msg) => write!(f, "Encode error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// A message received through a pattern subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Concrete topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// Stream of messages for one pattern subscription.
///
/// The stream ending means the underlying connection is gone.
pub type MessageStream = BoxStream<'static, Result<TransportMessage, TransportError>>;

/// Publish/subscribe transport
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Open a pattern subscription (`*` matches any run of characters,
    /// `?` a single character)
    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, TransportError>;

    /// Publish a payload, returning how many subscriptions received it
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError>;
}

/// Build the transport selected by the configuration
pub async fn connect(config: &PubSubConfig) -> Result<Arc<dyn PubSubTransport>, TransportError> {
    match config.backend {
        PubSubBackend::Redis => Ok(Arc::new(RedisTransport::connect(config).await?)),
        PubSubBackend::Memory => Ok(Arc::new(MemoryTransport::new())),
    }
}

/// Worker-side helper publishing job events into a namespace
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn PubSubTransport>,
    namespace: String,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn PubSubTransport>, namespace: impl Into<String>) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
        }
    }

    /// Publish a JSON event for a job.
    ///
    /// The payload should be an object carrying a `type` field; anything
    /// else is dropped by the receiving bridge.
    pub async fn publish(&self, channel_id: &str, payload: &Value) -> Result<usize, TransportError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| TransportError::Encode(e.to_string()))?;
        self.transport
            .publish(&topic_for(&self.namespace, channel_id), Bytes::from(bytes))
            .await
    }
}

/// Match a topic against a glob pattern (`*` and `?` wildcards)
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = topic.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the topic index it was tried at
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}
