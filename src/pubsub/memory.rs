//! In-process pub/sub transport

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{pattern_matches, MessageStream, PubSubTransport, TransportError, TransportMessage};

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

/// Pub/sub transport living entirely inside the process.
///
/// Delivery is synchronous with `publish`, so messages published before a
/// subscription is opened are never seen by it.
#[derive(Default)]
pub struct MemoryTransport {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// End every open subscription stream, as if the connection dropped
    pub fn sever(&self) {
        let severed = std::mem::take(&mut *self.subscribers.lock());
        debug!(count = severed.len(), "Severed memory subscriptions");
    }

    /// Number of live pattern subscriptions
    pub fn subscription_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            if !pattern_matches(&subscriber.pattern, topic) {
                continue;
            }
            let message = TransportMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if subscriber.tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
