//! Integration Tests for JobPulse
//!
//! These tests run the WebSocket server against an in-process pub/sub
//! transport and drive it with real WebSocket clients.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use jobpulse::config::{Config, PubSubBackend};
use jobpulse::hub::Hub;
use jobpulse::pubsub::{EventPublisher, MemoryTransport, PubSubTransport};
use jobpulse::server::Server;

/// Test configuration helper
fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    config.server.ws_path = "/ws".to_string();
    config.pubsub.backend = PubSubBackend::Memory;
    config.lifecycle.shutdown_timeout = Duration::from_millis(500);
    config
}

struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    transport: Arc<MemoryTransport>,
    publisher: EventPublisher,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<io::Result<()>>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let publisher = EventPublisher::new(transport.clone(), config.pubsub.namespace.clone());
        let hub = Hub::new(config, transport.clone(), None);
        let server = Server::bind(hub.clone()).await.expect("Failed to bind");
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            hub,
            transport,
            publisher,
            stop: Some(stop),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn client(&self) -> TestClient {
        TestClient::connect(&self.url("/ws")).await
    }

    /// Wait for the bridge subscription so publishes are not lost
    async fn wait_ready(&self) {
        for _ in 0..200 {
            if self.hub.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline never became ready");
    }

    async fn publish(&self, channel: &str, payload: Value) {
        self.publisher.publish(channel, &payload).await.unwrap();
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Helper struct for WebSocket client operations in tests
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(url: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("Failed to connect");
        Self { ws }
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("Failed to send");
    }

    /// Next JSON message, or None once the server closed the socket
    async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        loop {
            match timeout(wait, self.ws.next()).await {
                Err(_) => return None,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return None,
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"))
                }
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    async fn recv(&mut self) -> Value {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("Timeout waiting for message")
    }

    async fn expect_nothing(&mut self) {
        if let Some(message) = self.try_recv(Duration::from_millis(150)).await {
            panic!("unexpected message: {}", message);
        }
    }

    /// True once the server closed the connection
    async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    async fn subscribe(&mut self, channel: &str) {
        self.send(json!({"type": "subscribe", "channel": channel})).await;
        assert_eq!(
            self.recv().await,
            json!({"type": "subscribed", "channel": channel})
        );
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_event_reaches_only_subscribers() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;
    let mut b = server.client().await;

    a.subscribe("job-1").await;
    server.wait_ready().await;

    server
        .publish("job-1", json!({"type": "progress", "pct": 50}))
        .await;

    assert_eq!(a.recv().await, json!({"type": "progress", "pct": 50}));
    b.expect_nothing().await;
    a.expect_nothing().await;

    server.stop().await;
}

#[tokio::test]
async fn test_per_channel_order_in_storm() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;
    a.subscribe("job-1").await;
    a.subscribe("job-2").await;
    server.wait_ready().await;

    let storm = [
        ("job-1", 1),
        ("job-2", 1),
        ("job-1", 2),
        ("job-1", 3),
        ("job-2", 2),
    ];
    for (channel, seq) in storm {
        server
            .publish(channel, json!({"type": "progress", "job": channel, "seq": seq}))
            .await;
    }

    let mut received = Vec::new();
    for _ in 0..storm.len() {
        received.push(a.recv().await);
    }
    for channel in ["job-1", "job-2"] {
        let seqs: Vec<i64> = received
            .iter()
            .filter(|m| m["job"] == channel)
            .map(|m| m["seq"].as_i64().unwrap())
            .collect();
        let expected: Vec<i64> = storm
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, expected, "order broken on {}", channel);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_undecodable_events_are_skipped() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;
    a.subscribe("job-1").await;
    server.wait_ready().await;

    server
        .transport
        .publish("websocket:job-1", Bytes::from_static(b"not json"))
        .await
        .unwrap();
    server
        .transport
        .publish("websocket:job-1", Bytes::from_static(br#"{"pct":10}"#))
        .await
        .unwrap();
    server.publish("job-1", json!({"type": "completed"})).await;

    assert_eq!(a.recv().await, json!({"type": "completed"}));
    a.expect_nothing().await;

    server.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;
    a.subscribe("job-1").await;
    server.wait_ready().await;

    a.send(json!({"type": "unsubscribe", "channel": "job-1"})).await;
    assert_eq!(
        a.recv().await,
        json!({"type": "unsubscribed", "channel": "job-1"})
    );
    server.publish("job-1", json!({"type": "progress"})).await;
    a.expect_nothing().await;

    server.stop().await;
}

// ============================================================================
// Client protocol
// ============================================================================

#[tokio::test]
async fn test_wrong_path_rejected() {
    let server = TestServer::start(test_config()).await;

    match tokio_tungstenite::connect_async(server.url("/other")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("handshake on wrong path succeeded"),
    }
    assert_eq!(server.hub.registry().connection_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_messages_get_error_reply() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;

    a.ws.send(Message::Text("{oops".to_string())).await.unwrap();
    assert_eq!(a.recv().await["type"], "error");

    a.send(json!({"type": "shout"})).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("shout"));

    // Connection is still usable
    a.subscribe("job-1").await;

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit_rejects_with_error() {
    let mut config = test_config();
    config.limits.max_connections = 1;
    let server = TestServer::start(config).await;

    let mut a = server.client().await;
    a.subscribe("job-1").await;

    let mut b = server.client().await;
    let reply = b.recv().await;
    assert_eq!(reply["type"], "error");
    assert!(b.closed_within(Duration::from_secs(2)).await);
    assert_eq!(server.hub.registry().connection_count(), 1);

    server.stop().await;
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_silent_client_is_dropped() {
    let mut config = test_config();
    config.heartbeat.idle_interval = Duration::from_millis(200);
    config.heartbeat.pong_timeout = Duration::from_millis(100);
    let server = TestServer::start(config).await;

    let mut a = server.client().await;
    a.subscribe("job-1").await;

    assert_eq!(a.recv().await, json!({"type": "ping"}));
    assert!(a.closed_within(Duration::from_secs(2)).await);
    assert_eq!(server.hub.registry().connection_count(), 0);
    assert!(!server.hub.registry().has_channel("job-1"));

    server.stop().await;
}

#[tokio::test]
async fn test_pong_keeps_client_connected() {
    let mut config = test_config();
    config.heartbeat.idle_interval = Duration::from_millis(200);
    config.heartbeat.pong_timeout = Duration::from_millis(100);
    let server = TestServer::start(config).await;

    let mut a = server.client().await;
    for _ in 0..3 {
        assert_eq!(a.recv().await, json!({"type": "ping"}));
        a.send(json!({"type": "pong"})).await;
    }
    assert_eq!(server.hub.registry().connection_count(), 1);

    server.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.client().await;
    a.subscribe("job-1").await;
    server.wait_ready().await;

    let hub = server.hub.clone();
    let transport = server.transport.clone();
    server.stop().await;

    assert!(a.closed_within(Duration::from_secs(2)).await);
    assert_eq!(hub.registry().connection_count(), 0);
    assert_eq!(transport.subscription_count(), 0);
}
