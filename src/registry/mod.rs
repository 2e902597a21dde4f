//! Connection Registry
//!
//! The authoritative bidirectional index between open connections and the
//! channels they subscribe to. Both directions live behind one mutex so a
//! dispatch lookup never observes a half-applied subscribe, unsubscribe or
//! removal.
//!
//! Channels are implicit: a channel entry exists exactly while its
//! subscriber list is non-empty. The first subscribe creates it and the
//! last unsubscribe (or the removal of its last connection) deletes it.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId};


/// Result of a subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Relation created
    Subscribed,
    /// Connection was already subscribed; nothing changed
    AlreadySubscribed,
    /// Connection is not registered
    UnknownConnection,
    /// Connection reached the per-connection limit
    LimitReached,
}

struct Entry {
    connection: Arc<Connection>,
    channels: AHashSet<String>,
}

#[derive(Default)]
struct Indexes {
    /// connection -> channels it subscribes to
    connections: AHashMap<ConnectionId, Entry>,
    /// channel -> subscribers in subscription order
    channels: AHashMap<String, Vec<Arc<Connection>>>,
}

impl Indexes {
    /// Drop `id` from a channel's list, deleting the channel once empty
    fn detach(&mut self, channel: &str, id: ConnectionId) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|c| c.id() != id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

/// Thread-safe connection/channel index
pub struct ConnectionRegistry {
    inner: Mutex<Indexes>,
    /// Maximum channels per connection (0 = unbounded)
    max_subscriptions: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// Create a registry capping the channels a single connection may join
    pub fn with_limit(max_subscriptions: usize) -> Self {
        Self {
            inner: Mutex::new(Indexes::default()),
            max_subscriptions,
        }
    }

    /// Add a connection with no subscriptions. No-op if already present.
    pub fn register(&self, connection: Arc<Connection>) {
        let mut inner = self.inner.lock();
        inner
            .connections
            .entry(connection.id())
            .or_insert_with(|| Entry {
                connection,
                channels: AHashSet::new(),
            });
    }

    /// Subscribe a registered connection to a channel.
    pub fn subscribe(&self, id: ConnectionId, channel: &str) -> SubscribeOutcome {
        let mut inner = self.inner.lock();
        let Indexes {
            connections,
            channels,
        } = &mut *inner;

        let Some(entry) = connections.get_mut(&id) else {
            warn!(conn = %id, channel, "Subscribe from unknown connection ignored");
            return SubscribeOutcome::UnknownConnection;
        };

        if entry.channels.contains(channel) {
            return SubscribeOutcome::AlreadySubscribed;
        }
        if self.max_subscriptions > 0 && entry.channels.len() >= self.max_subscriptions {
            return SubscribeOutcome::LimitReached;
        }

        entry.channels.insert(channel.to_string());
        let subscribers = channels.entry(channel.to_string()).or_default();
        if !subscribers.iter().any(|c| c.id() == id) {
            subscribers.push(entry.connection.clone());
        }
        debug!(conn = %id, channel, "Subscribed");
        SubscribeOutcome::Subscribed
    }

    /// Remove the relation between a connection and a channel.
    ///
    /// Returns true if the connection was subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut inner = self.inner.lock();
        let was_subscribed = inner
            .connections
            .get_mut(&id)
            .map(|entry| entry.channels.remove(channel))
            .unwrap_or(false);
        inner.detach(channel, id);
        if was_subscribed {
            debug!(conn = %id, channel, "Unsubscribed");
        }
        was_subscribed
    }

    /// Remove a connection and every subscription it holds.
    ///
    /// Returns the channels the connection was subscribed to.
    pub fn remove(&self, id: ConnectionId) -> AHashSet<String> {
        self.take(id).unwrap_or_default()
    }

    /// Like [`remove`](Self::remove), but `None` if the connection was not
    /// registered. Exactly one of several racing callers gets `Some`.
    pub fn take(&self, id: ConnectionId) -> Option<AHashSet<String>> {
        let mut inner = self.inner.lock();
        let entry = inner.connections.remove(&id)?;
        for channel in &entry.channels {
            inner.detach(channel, id);
        }
        Some(entry.channels)
    }

    /// Snapshot of a channel's subscribers, in subscription order
    pub fn subscribers_of(&self, channel: &str) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every connection, returning them for shutdown
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.channels.clear();
        inner
            .connections
            .drain()
            .map(|(_, entry)| entry.connection)
            .collect()
    }

    /// Channels a connection currently subscribes to
    #[cfg(test)]
    pub(crate) fn channels_of(&self, id: ConnectionId) -> AHashSet<String> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(|entry| entry.channels.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.inner.lock().channels.contains_key(channel)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Total connection/channel relations
    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.inner
            .lock()
            .connections
            .values()
            .map(|entry| entry.channels.len())
            .sum()
    }

    /// Verify that both indexes describe the same relation and that no
    /// empty channel entry exists.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();

        let forward_ok = inner.connections.iter().all(|(id, entry)| {
            entry.channels.iter().all(|channel| {
                inner
                    .channels
                    .get(channel)
                    .is_some_and(|subs| subs.iter().filter(|c| c.id() == *id).count() == 1)
            })
        });

        let reverse_ok = inner.channels.iter().all(|(channel, subs)| {
            !subs.is_empty()
                && subs.iter().all(|c| {
                    inner
                        .connections
                        .get(&c.id())
                        .is_some_and(|entry| entry.channels.contains(channel))
                })
        });

        forward_ok && reverse_ok
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
