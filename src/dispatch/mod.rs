//! Dispatch Loop
//!
//! Single consumer of the event queue. Events are taken strictly in arrival
//! order; each one is fanned out concurrently to the channel's current
//! subscribers, and the loop waits for every send to finish before taking
//! the next event. A slow channel therefore delays later events of other
//! channels. That is the backpressure point between the bridge and clients.
//!
//! Subscribers whose send fails are evicted from the registry and closed.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::metrics::Metrics;
use crate::protocol::Event;
use crate::registry::ConnectionRegistry;


/// Receiving end of the event queue, shared across dispatch loop restarts
pub type SharedQueue = Arc<Mutex<mpsc::Receiver<Event>>>;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// Drains the event queue into subscriber connections
pub struct DispatchLoop {
    queue: SharedQueue,
    registry: Arc<ConnectionRegistry>,
    max_concurrent_sends: usize,
    metrics: Option<Arc<Metrics>>,
}

impl DispatchLoop {
    pub fn new(
        queue: SharedQueue,
        registry: Arc<ConnectionRegistry>,
        max_concurrent_sends: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            queue,
            registry,
            max_concurrent_sends: max_concurrent_sends.max(1),
            metrics,
        }
    }

    /// Run until cancelled or until every queue sender is gone.
    ///
    /// Cancellation is only observed between events: an in-progress
    /// fan-out always completes, and events already queued at that point
    /// are still delivered before returning.
    pub async fn run(self, cancel: CancellationToken) {
        // A previous loop may still hold the queue while it drains
        let mut queue = tokio::select! {
            biased;
            _ = cancel.cancelled() => match self.queue.clone().try_lock_owned() {
                Ok(queue) => queue,
                // The holder drains it
                Err(_) => return,
            },
            queue = self.queue.clone().lock_owned() => queue,
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("Event queue closed");
                        return;
                    }
                },
            };
            self.dispatch(event).await;
        }

        let mut drained = 0usize;
        while let Ok(event) = queue.try_recv() {
            self.dispatch(event).await;
            drained += 1;
        }
        info!(drained, "Dispatch loop stopped");
    }

    /// Deliver one event to every current subscriber of its channel.
    pub async fn dispatch(&self, event: Event) -> FanOut {
        if let Some(ref m) = self.metrics {
            m.observe_queue_latency(event.timestamp.elapsed());
        }

        // Connections being torn down stay in older snapshots until removed
        let subscribers: Vec<Arc<Connection>> = self
            .registry
            .subscribers_of(&event.channel_id)
            .into_iter()
            .filter(|conn| conn.is_alive())
            .collect();
        if subscribers.is_empty() {
            if let Some(ref m) = self.metrics {
                m.event_discarded();
            }
            debug!(channel = %event.channel_id, "No subscribers, event discarded");
            return FanOut::default();
        }

        let started = Instant::now();
        let text: Arc<str> = Arc::from(event.to_text());
        let channel = &event.channel_id;
        let failures: Vec<Arc<Connection>> = stream::iter(subscribers.iter().cloned())
            .map(|conn| {
                let text = text.clone();
                async move {
                    match conn.send(&text).await {
                        Ok(()) => None,
                        Err(e) => {
                            warn!(conn = %conn.id(), channel = %channel, "Send failed: {}", e);
                            Some(conn)
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent_sends)
            .filter_map(|failed| async move { failed })
            .collect()
            .await;

        let outcome = FanOut {
            delivered: subscribers.len() - failures.len(),
            failed: failures.len(),
        };

        // Each close may take up to the send timeout
        stream::iter(failures)
            .for_each_concurrent(self.max_concurrent_sends, |conn| async move {
                self.evict(&conn).await;
            })
            .await;

        if let Some(ref m) = self.metrics {
            m.event_fanned_out(outcome.delivered, outcome.failed, started.elapsed());
        }
        debug!(
            channel = %event.channel_id,
            kind = %event.kind,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Event dispatched"
        );
        outcome
    }

    async fn evict(&self, conn: &Arc<Connection>) {
        // A concurrent session exit may already have taken it
        if let Some(channels) = self.registry.take(conn.id()) {
            if let Some(ref m) = self.metrics {
                m.client_removed("send_failed", channels.len());
            }
            info!(conn = %conn.id(), channels = channels.len(), "Evicted after send failure");
        }
        conn.close().await;
    }
}
