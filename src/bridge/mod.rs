//! Inbound Bridge
//!
//! Connects the external pub/sub transport to the internal dispatch queue.
//! The bridge opens one pattern subscription covering every job channel of
//! the namespace (`<namespace>:*`), decodes each message into an [`Event`]
//! and pushes it onto the bounded queue consumed by the dispatch loop.
//!
//! Undecodable messages are logged and dropped. A transport failure ends
//! the bridge with an error so the lifecycle controller can start a fresh
//! one; it never keeps running on a dead subscription.

use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::protocol::{topic_for, Event};
use crate::pubsub::{MessageStream, PubSubTransport, TransportError, TransportMessage};


/// Why a bridge stopped without being cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Subscribing or receiving failed
    Transport(TransportError),
    /// Subscription stream ended
    StreamEnded,
    /// The dispatch queue is gone
    QueueClosed,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Transport(e) => write!(f, "transport error: {}", e),
            BridgeError::StreamEnded => write!(f, "subscription stream ended"),
            BridgeError::QueueClosed => write!(f, "dispatch queue closed"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<TransportError> for BridgeError {
    fn from(e: TransportError) -> Self {
        BridgeError::Transport(e)
    }
}

/// Callback run once the pattern subscription is established
pub type SubscribedHook = Box<dyn FnOnce() + Send + Sync>;

/// Pattern-subscribes to the transport and feeds the dispatch queue
pub struct InboundBridge {
    transport: Arc<dyn PubSubTransport>,
    namespace: String,
    queue: mpsc::Sender<Event>,
    metrics: Option<Arc<Metrics>>,
    on_subscribed: Option<SubscribedHook>,
}

impl InboundBridge {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        namespace: impl Into<String>,
        queue: mpsc::Sender<Event>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            queue,
            metrics,
            on_subscribed: None,
        }
    }

    /// Run `hook` once the subscription is open
    pub fn on_subscribed(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_subscribed = Some(Box::new(hook));
        self
    }

    /// Run until cancelled (`Ok`) or until the transport fails (`Err`).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let pattern = topic_for(&self.namespace, "*");
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            stream = self.transport.psubscribe(&pattern) => stream?,
        };
        info!(
            transport = self.transport.name(),
            pattern = %pattern,
            "Inbound bridge subscribed"
        );
        if let Some(hook) = self.on_subscribed.take() {
            hook();
        }
        self.pump(stream, cancel).await
    }

    async fn pump(&self, mut stream: MessageStream, cancel: CancellationToken) -> Result<(), BridgeError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Inbound bridge cancelled");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(BridgeError::StreamEnded),
                },
            };

            let Some(event) = self.decode(&message) else {
                continue;
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = self.queue.send(event) => {
                    if sent.is_err() {
                        return Err(BridgeError::QueueClosed);
                    }
                }
            }
        }
    }

    fn decode(&self, message: &TransportMessage) -> Option<Event> {
        match Event::decode(&self.namespace, &message.topic, &message.payload) {
            Ok(event) => {
                if let Some(ref m) = self.metrics {
                    m.event_received();
                }
                debug!(channel = %event.channel_id, kind = %event.kind, "Event received");
                Some(event)
            }
            Err(e) => {
                if let Some(ref m) = self.metrics {
                    m.event_dropped();
                }
                warn!(topic = %message.topic, "Dropping inbound message: {}", e);
                None
            }
        }
    }
}
