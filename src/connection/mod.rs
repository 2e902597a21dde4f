//! Client Connections
//!
//! A [`Connection`] is the server's handle on one client transport endpoint.
//! The transport itself is reached only through the [`ClientSink`]
//! capability (send a text frame, close), so the registry, the dispatcher
//! and the heartbeat logic never depend on a concrete socket type.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::ServerMessage;

/// Connection identifier, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Error when sending to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed or closing
    Closed,
    /// Send did not complete in time
    Timeout,
    /// Message could not be serialized
    Encode(String),
    /// Transport write failed
    Transport(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Timeout => write!(f, "send timed out"),
            SendError::Encode(e) => write!(f, "encode error: {}", e),
            SendError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// Outbound half of a client transport
#[async_trait]
pub trait ClientSink: Send + Sync {
    /// Deliver one text message, resolving once the transport accepted it
    async fn send(&self, text: &str) -> Result<(), SendError>;

    /// Close the transport; must tolerate repeated calls
    async fn close(&self);
}

/// Liveness state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    /// Registered and usable
    Alive = 0,
    /// Being torn down; no further sends
    Draining = 1,
    /// Transport closed
    Closed = 2,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Liveness::Alive,
            1 => Liveness::Draining,
            _ => Liveness::Closed,
        }
    }
}

/// Handle to one client connection
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    sink: Arc<dyn ClientSink>,
    liveness: AtomicU8,
    last_pong: Mutex<Instant>,
    send_timeout: Duration,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        sink: Arc<dyn ClientSink>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            sink,
            liveness: AtomicU8::new(Liveness::Alive as u8),
            last_pong: Mutex::new(Instant::now()),
            send_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    /// Time the last pong was received (connection start if none yet)
    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Send a raw text frame, bounded by the connection's send timeout.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        match timeout(self.send_timeout, self.sink.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Send a server control message
    pub async fn send_message(&self, message: &ServerMessage) -> Result<(), SendError> {
        let text = message
            .to_text()
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send(&text).await
    }

    /// Stop accepting sends without closing the transport yet.
    ///
    /// Returns false if the connection was already draining or closed.
    pub fn begin_drain(&self) -> bool {
        self.liveness
            .compare_exchange(
                Liveness::Alive as u8,
                Liveness::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close the transport. Idempotent; only the first call reaches the sink.
    pub async fn close(&self) {
        let previous = self.liveness.swap(Liveness::Closed as u8, Ordering::AcqRel);
        if previous == Liveness::Closed as u8 {
            return;
        }
        self.closed.cancel();
        if timeout(self.send_timeout, self.sink.close()).await.is_err() {
            debug!(conn = %self.id, "Close handshake timed out");
        }
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("liveness", &self.liveness())
            .finish()
    }
}

/// Sink that hands messages to an in-process channel.
///
/// Used to embed the hub behind a transport owned by another server, and in
/// tests. Sends fail once the receiving half is dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn send(&self, text: &str) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx
            .send(text.to_string())
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(sink: Arc<dyn ClientSink>) -> Connection {
        Connection::new(ConnectionId(1), None, sink, Duration::from_millis(200))
    }

    struct StalledSink;

    #[async_trait]
    impl ClientSink for StalledSink {
        async fn send(&self, _text: &str) -> Result<(), SendError> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_send_reaches_sink() {
        let (sink, mut rx) = ChannelSink::new();
        let conn = connection(Arc::new(sink));

        conn.send(r#"{"type":"progress"}"#).await.unwrap();
        conn.send_message(&ServerMessage::Ping).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"progress"}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let conn = connection(Arc::new(sink));

        assert_eq!(conn.send("x").await, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let conn = connection(Arc::new(StalledSink));
        assert_eq!(conn.send("x").await, Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (sink, _rx) = ChannelSink::new();
        let sink = Arc::new(sink);
        let conn = connection(sink.clone());

        assert!(conn.is_alive());
        conn.close().await;
        conn.close().await;

        assert_eq!(conn.liveness(), Liveness::Closed);
        assert!(sink.is_closed());
        assert_eq!(conn.send("x").await, Err(SendError::Closed));
        // Already resolved after close
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_drain_blocks_sends() {
        let (sink, _rx) = ChannelSink::new();
        let conn = connection(Arc::new(sink));

        assert!(conn.begin_drain());
        assert!(!conn.begin_drain());
        assert_eq!(conn.liveness(), Liveness::Draining);
        assert_eq!(conn.send("x").await, Err(SendError::Closed));
    }

    #[test]
    fn test_record_pong_advances() {
        let (sink, _rx) = ChannelSink::new();
        let conn = connection(Arc::new(sink));
        let before = conn.last_pong();
        std::thread::sleep(Duration::from_millis(5));
        conn.record_pong();
        assert!(conn.last_pong() > before);
    }
}
