//! Hub
//!
//! Owns the connection registry and the lifecycle of the two background
//! tasks (inbound bridge and dispatch loop).
//!
//! Tasks start lazily with the first client connection and move through
//! `Stopped → Starting → Running → Stopping → Stopped`. A task that ends
//! on its own is restarted, immediately when the next client connects or
//! subscribes, otherwise after a backoff while clients remain connected.
//! Shutdown cancels both tasks with one bounded wait, abandons whatever is
//! still running after it, and closes every connection.

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use futures_util::{FutureExt, Stream};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::InboundBridge;
use crate::config::Config;
use crate::connection::{ClientSink, Connection, ConnectionId};
use crate::dispatch::DispatchLoop;
use crate::metrics::Metrics;
use crate::protocol::{validate_channel, ProtocolError};
use crate::pubsub::PubSubTransport;
use crate::registry::{ConnectionRegistry, SubscribeOutcome};
use crate::session::{Session, SessionEnd};
use crate::transport::Inbound;

mod lifecycle;

#[cfg(test)]
mod tests;

pub use lifecycle::{LifecycleState, TaskKind, TaskStatus};

use lifecycle::Lifecycle;

/// Reasons a connection is refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Shutdown in progress
    ShuttingDown,
    /// Connection limit reached
    TooManyConnections(usize),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::ShuttingDown => write!(f, "server is shutting down"),
            HubError::TooManyConnections(max) => {
                write!(f, "connection limit of {} reached", max)
            }
        }
    }
}

impl std::error::Error for HubError {}

pub struct Hub {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn PubSubTransport>,
    metrics: Option<Arc<Metrics>>,
    lifecycle: Mutex<Lifecycle>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new(
        config: Config,
        transport: Arc<dyn PubSubTransport>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::with_limit(
            config.limits.max_subscriptions_per_connection,
        ));
        let lifecycle = Lifecycle::new(
            config.dispatch.queue_capacity,
            config.lifecycle.restart_backoff,
        );
        Arc::new(Self {
            config,
            registry,
            transport,
            metrics,
            lifecycle: Mutex::new(lifecycle),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.lock().state
    }

    pub fn task_status(&self, kind: TaskKind) -> TaskStatus {
        self.lifecycle.lock().task_status(kind)
    }

    /// Pipeline is up: bridge subscribed and both tasks alive
    pub fn is_ready(&self) -> bool {
        let lc = self.lifecycle.lock();
        lc.state == LifecycleState::Running
            && lc.task_status(TaskKind::Bridge) == TaskStatus::Running
            && lc.task_status(TaskKind::Dispatcher) == TaskStatus::Running
    }

    /// Register a new client connection.
    ///
    /// Starts (or restarts) the background tasks as needed.
    pub fn connect(
        self: &Arc<Self>,
        sink: Arc<dyn ClientSink>,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Connection>, HubError> {
        // Registration and the Stopping check share the lifecycle lock so a
        // shutdown never misses a connection
        let mut lc = self.lifecycle.lock();
        if lc.state == LifecycleState::Stopping {
            if let Some(ref m) = self.metrics {
                m.connection_rejected("shutting_down");
            }
            return Err(HubError::ShuttingDown);
        }

        let max = self.config.limits.max_connections;
        if max > 0 && self.registry.connection_count() >= max {
            if let Some(ref m) = self.metrics {
                m.connection_rejected("limit");
            }
            warn!(peer = ?peer, max, "Connection limit reached, rejecting client");
            return Err(HubError::TooManyConnections(max));
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(
            id,
            peer,
            sink,
            self.config.dispatch.send_timeout,
        ));
        self.registry.register(conn.clone());
        if let Some(ref m) = self.metrics {
            m.client_connected();
        }
        info!(conn = %id, peer = ?peer, "Client connected");

        lc.backoff = self.config.lifecycle.restart_backoff;
        self.start_tasks(&mut lc);
        Ok(conn)
    }

    /// Run the receive/heartbeat loop of a connection until it ends.
    pub async fn serve<S>(self: &Arc<Self>, conn: Arc<Connection>, inbound: S) -> SessionEnd
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        Session::new(self.clone(), conn).run(inbound).await
    }

    /// Subscribe a connection to a channel after validating the channel id
    pub fn subscribe(
        self: &Arc<Self>,
        conn: &Connection,
        channel: &str,
    ) -> Result<SubscribeOutcome, ProtocolError> {
        validate_channel(channel, self.config.limits.max_channel_length)?;
        let outcome = self.registry.subscribe(conn.id(), channel);
        if outcome == SubscribeOutcome::Subscribed {
            if let Some(ref m) = self.metrics {
                m.subscription_added();
            }
            self.ensure_started();
        }
        Ok(outcome)
    }

    /// Returns true if the connection was subscribed
    pub fn unsubscribe(&self, conn: &Connection, channel: &str) -> bool {
        let removed = self.registry.unsubscribe(conn.id(), channel);
        if removed {
            if let Some(ref m) = self.metrics {
                m.subscription_removed();
            }
        }
        removed
    }

    /// Remove a connection from the registry and close it
    pub async fn disconnect(&self, conn: &Connection) {
        self.evict(conn, "closed").await;
    }

    pub(crate) async fn evict(&self, conn: &Connection, reason: &str) {
        // Fan-outs holding an older snapshot skip it from here on
        conn.begin_drain();
        if let Some(channels) = self.registry.take(conn.id()) {
            if let Some(ref m) = self.metrics {
                m.client_removed(reason, channels.len());
            }
            info!(
                conn = %conn.id(),
                reason,
                channels = channels.len(),
                "Client disconnected"
            );
        }
        conn.close().await;
    }

    /// Start any background task that is not running.
    pub fn ensure_started(self: &Arc<Self>) {
        let mut lc = self.lifecycle.lock();
        self.start_tasks(&mut lc);
    }

    fn start_tasks(self: &Arc<Self>, lc: &mut Lifecycle) {
        if lc.state == LifecycleState::Stopping {
            return;
        }
        if lc.state == LifecycleState::Stopped {
            lc.state = LifecycleState::Starting;
        }

        // Dispatcher first so the bridge never fills a queue nobody drains
        for kind in [TaskKind::Dispatcher, TaskKind::Bridge] {
            let slot = lc.slot_mut(kind);
            if !slot.needs_start() {
                continue;
            }
            if slot.status() == TaskStatus::Failed {
                if let Some(ref m) = self.metrics {
                    m.task_restarted(kind.name());
                }
                info!(task = kind.name(), "Restarting background task");
            } else {
                debug!(task = kind.name(), "Starting background task");
            }
            slot.clear();
            if kind == TaskKind::Bridge {
                lc.state = LifecycleState::Starting;
            }
            self.spawn_task(lc, kind);
        }
    }

    fn spawn_task(self: &Arc<Self>, lc: &mut Lifecycle, kind: TaskKind) {
        let generation = lc.slot_mut(kind).next_generation();
        let cancel = lc.cancel.clone();
        let hub = Arc::downgrade(self);

        let task: BoxFuture<'static, Result<(), String>> = match kind {
            TaskKind::Bridge => {
                let ready = hub.clone();
                let bridge = InboundBridge::new(
                    self.transport.clone(),
                    self.config.pubsub.namespace.clone(),
                    lc.queue_tx.clone(),
                    self.metrics.clone(),
                )
                .on_subscribed(move || {
                    if let Some(hub) = ready.upgrade() {
                        hub.mark_running(generation);
                    }
                });
                async move { bridge.run(cancel).await.map_err(|e| e.to_string()) }.boxed()
            }
            TaskKind::Dispatcher => {
                let dispatcher = DispatchLoop::new(
                    lc.queue_rx.clone(),
                    self.registry.clone(),
                    self.config.dispatch.max_concurrent_sends,
                    self.metrics.clone(),
                );
                async move {
                    dispatcher.run(cancel).await;
                    Ok(())
                }
                .boxed()
            }
        };

        let handle = tokio::spawn(async move {
            let failure = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some("task panicked".to_string()),
            };
            if let Some(hub) = hub.upgrade() {
                hub.on_task_exit(kind, generation, failure);
            }
        });
        lc.slot_mut(kind).install(handle);
    }

    fn mark_running(&self, generation: u64) {
        let mut lc = self.lifecycle.lock();
        if lc.state == LifecycleState::Starting && lc.bridge.is_current(generation) {
            lc.state = LifecycleState::Running;
            info!(transport = self.transport.name(), "Event pipeline running");
        }
    }

    fn on_task_exit(self: &Arc<Self>, kind: TaskKind, generation: u64, failure: Option<String>) {
        let mut lc = self.lifecycle.lock();
        if lc.cancel.is_cancelled()
            || matches!(lc.state, LifecycleState::Stopping | LifecycleState::Stopped)
        {
            return;
        }
        if !lc.slot_mut(kind).mark_exited(generation) {
            return;
        }

        match failure {
            Some(e) => error!(task = kind.name(), "Background task failed: {}", e),
            None => warn!(task = kind.name(), "Background task exited unexpectedly"),
        }
        self.schedule_restart(&mut lc);
    }

    fn schedule_restart(self: &Arc<Self>, lc: &mut Lifecycle) {
        if lc.restart_pending || self.registry.connection_count() == 0 {
            return;
        }
        lc.restart_pending = true;
        let delay = lc.backoff;
        lc.backoff = lc
            .backoff
            .saturating_mul(2)
            .min(self.config.lifecycle.max_restart_backoff);
        info!(delay = ?delay, "Scheduling background task restart");

        let hub: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(hub) = hub.upgrade() {
                hub.restart_failed();
            }
        });
    }

    fn restart_failed(self: &Arc<Self>) {
        let mut lc = self.lifecycle.lock();
        lc.restart_pending = false;
        if matches!(lc.state, LifecycleState::Stopping | LifecycleState::Stopped)
            || self.registry.connection_count() == 0
        {
            return;
        }
        self.start_tasks(&mut lc);
    }

    /// Stop the background tasks and close every connection.
    ///
    /// Waits at most `lifecycle.shutdown_timeout` for the tasks; any task
    /// still running after that is aborted. Calling this again, or while a
    /// shutdown is already running, is a no-op.
    pub async fn shutdown(&self) {
        let handles = {
            let mut lc = self.lifecycle.lock();
            if lc.state == LifecycleState::Stopping {
                debug!("Shutdown already in progress");
                return;
            }
            if lc.state == LifecycleState::Stopped && self.registry.connection_count() == 0 {
                return;
            }
            lc.state = LifecycleState::Stopping;
            lc.cancel.cancel();
            [
                (TaskKind::Dispatcher, lc.dispatcher.begin_stop()),
                (TaskKind::Bridge, lc.bridge.begin_stop()),
            ]
        };
        info!("Hub shutting down");

        let limit = self.config.lifecycle.shutdown_timeout;
        let deadline = Instant::now() + limit;
        for (kind, handle) in handles {
            let Some(handle) = handle else {
                continue;
            };
            let abort = handle.abort_handle();
            match timeout_at(deadline, handle).await {
                Ok(_) => debug!(task = kind.name(), "Background task stopped"),
                Err(_) => {
                    warn!(
                        task = kind.name(),
                        "Background task did not stop within {:?}, abandoning", limit
                    );
                    abort.abort();
                }
            }
        }

        let connections = self.registry.drain();
        let closed = connections.len();
        if let Some(ref m) = self.metrics {
            for _ in 0..closed {
                m.client_removed("shutdown", 0);
            }
            m.subscriptions_current.set(0);
        }
        stream::iter(connections)
            .for_each_concurrent(None, |conn| async move { conn.close().await })
            .await;

        {
            let mut lc = self.lifecycle.lock();
            lc.state = LifecycleState::Stopped;
            lc.bridge.reset();
            lc.dispatcher.reset();
            lc.cancel = CancellationToken::new();
            lc.backoff = self.config.lifecycle.restart_backoff;
            lc.restart_pending = false;
        }
        info!(closed, "Hub stopped");
    }
}
