//! Hub lifecycle tests

use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::config::PubSubBackend;
use crate::connection::{ChannelSink, SendError};
use crate::pubsub::{EventPublisher, MemoryTransport};

fn config() -> Config {
    let mut config = Config::default();
    config.pubsub.backend = PubSubBackend::Memory;
    config.lifecycle.restart_backoff = Duration::from_millis(20);
    config.lifecycle.max_restart_backoff = Duration::from_millis(80);
    config.lifecycle.shutdown_timeout = Duration::from_millis(200);
    config
}

fn setup(config: Config) -> (Arc<Hub>, Arc<MemoryTransport>, Arc<Metrics>) {
    let transport = Arc::new(MemoryTransport::new());
    let metrics = Arc::new(Metrics::new());
    let hub = Hub::new(config, transport.clone(), Some(metrics.clone()));
    (hub, transport, metrics)
}

fn client(hub: &Arc<Hub>) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let (sink, rx) = ChannelSink::new();
    (hub.connect(Arc::new(sink), None).unwrap(), rx)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Sink whose sends never complete
struct StalledSink;

#[async_trait]
impl ClientSink for StalledSink {
    async fn send(&self, _text: &str) -> Result<(), SendError> {
        std::future::pending().await
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn test_tasks_start_lazily() {
    let (hub, transport, _) = setup(config());
    assert_eq!(hub.state(), LifecycleState::Stopped);
    assert_eq!(hub.task_status(TaskKind::Bridge), TaskStatus::NotStarted);
    assert_eq!(hub.task_status(TaskKind::Dispatcher), TaskStatus::NotStarted);
    assert_eq!(transport.subscription_count(), 0);

    let (_conn, _rx) = client(&hub);
    wait_until("running", || hub.state() == LifecycleState::Running).await;

    assert!(hub.is_ready());
    assert_eq!(hub.task_status(TaskKind::Bridge), TaskStatus::Running);
    assert_eq!(hub.task_status(TaskKind::Dispatcher), TaskStatus::Running);
    assert_eq!(transport.subscription_count(), 1);

    // A second connection does not spawn a second bridge
    let (_conn2, _rx2) = client(&hub);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.subscription_count(), 1);
}

#[tokio::test]
async fn test_event_reaches_subscriber() {
    let (hub, transport, metrics) = setup(config());
    let (a, mut rx_a) = client(&hub);
    let (_b, mut rx_b) = client(&hub);
    hub.subscribe(&a, "job-1").unwrap();
    wait_until("running", || hub.is_ready()).await;

    let publisher = EventPublisher::new(transport.clone(), "websocket");
    publisher
        .publish("job-1", &json!({"type": "progress", "pct": 50}))
        .await
        .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&text).unwrap(),
        json!({"type": "progress", "pct": 50})
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx_b.try_recv().is_err());
    assert_eq!(metrics.events_delivered.get(), 1);
}

#[tokio::test]
async fn test_failed_bridge_restarts_with_backoff() {
    let (hub, transport, metrics) = setup(config());
    let (_conn, _rx) = client(&hub);
    wait_until("running", || hub.is_ready()).await;

    transport.sever();
    wait_until("restart", || {
        metrics
            .task_restarts
            .with_label_values(&["bridge"])
            .get()
            == 1
    })
    .await;
    wait_until("running again", || hub.is_ready()).await;
    assert_eq!(transport.subscription_count(), 1);
    assert_eq!(hub.task_status(TaskKind::Dispatcher), TaskStatus::Running);
}

#[tokio::test]
async fn test_new_connection_restarts_immediately() {
    let mut config = config();
    config.lifecycle.restart_backoff = Duration::from_secs(30);
    config.lifecycle.max_restart_backoff = Duration::from_secs(60);
    let (hub, transport, _) = setup(config);
    let (_conn, _rx) = client(&hub);
    wait_until("running", || hub.is_ready()).await;

    transport.sever();
    wait_until("failed", || hub.task_status(TaskKind::Bridge) == TaskStatus::Failed).await;
    assert!(!hub.is_ready());

    // The backoff is long, but a new client triggers the restart now
    let (_conn2, _rx2) = client(&hub);
    wait_until("running again", || hub.is_ready()).await;
    assert_eq!(transport.subscription_count(), 1);
}

#[tokio::test]
async fn test_no_restart_without_connections() {
    let (hub, transport, metrics) = setup(config());
    let (conn, _rx) = client(&hub);
    wait_until("running", || hub.is_ready()).await;
    hub.disconnect(&conn).await;

    transport.sever();
    wait_until("failed", || hub.task_status(TaskKind::Bridge) == TaskStatus::Failed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(hub.task_status(TaskKind::Bridge), TaskStatus::Failed);
    assert_eq!(
        metrics.task_restarts.with_label_values(&["bridge"]).get(),
        0
    );
}

#[tokio::test]
async fn test_shutdown_closes_everything_and_is_idempotent() {
    let (hub, transport, metrics) = setup(config());
    let (a, _rx_a) = client(&hub);
    let (b, _rx_b) = client(&hub);
    hub.subscribe(&a, "job-1").unwrap();
    wait_until("running", || hub.is_ready()).await;

    hub.shutdown().await;

    assert_eq!(hub.state(), LifecycleState::Stopped);
    assert_eq!(hub.task_status(TaskKind::Bridge), TaskStatus::NotStarted);
    assert_eq!(hub.registry().connection_count(), 0);
    assert_eq!(hub.registry().channel_count(), 0);
    assert!(!a.is_alive());
    assert!(!b.is_alive());
    assert_eq!(transport.subscription_count(), 0);
    assert_eq!(metrics.connections_current.get(), 0);

    hub.shutdown().await;
    assert_eq!(hub.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_shutdown_before_start_is_noop() {
    let (hub, _, _) = setup(config());
    hub.shutdown().await;
    assert_eq!(hub.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_shutdown_abandons_stuck_dispatch() {
    let mut config = config();
    config.dispatch.send_timeout = Duration::from_secs(600);
    let (hub, transport, _) = setup(config);
    let stuck = hub.connect(Arc::new(StalledSink), None).unwrap();
    hub.subscribe(&stuck, "job-1").unwrap();
    wait_until("running", || hub.is_ready()).await;

    EventPublisher::new(transport.clone(), "websocket")
        .publish("job-1", &json!({"type": "progress"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), hub.shutdown())
        .await
        .expect("shutdown blocked");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(hub.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_connect_after_shutdown_restarts_pipeline() {
    let (hub, transport, _) = setup(config());
    let (_conn, _rx) = client(&hub);
    wait_until("running", || hub.is_ready()).await;
    hub.shutdown().await;

    let (_conn2, _rx2) = client(&hub);
    wait_until("running again", || hub.is_ready()).await;
    assert_eq!(transport.subscription_count(), 1);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = config();
    config.limits.max_connections = 1;
    let (hub, _, metrics) = setup(config);
    let (_a, _rx) = client(&hub);

    let (sink, _rx2) = ChannelSink::new();
    assert_eq!(
        hub.connect(Arc::new(sink), None).unwrap_err(),
        HubError::TooManyConnections(1)
    );
    assert_eq!(
        metrics
            .connections_rejected_total
            .with_label_values(&["limit"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_subscribe_validates_channel() {
    let (hub, _, metrics) = setup(config());
    let (a, _rx) = client(&hub);

    assert!(matches!(
        hub.subscribe(&a, ""),
        Err(ProtocolError::InvalidChannel(_))
    ));
    assert_eq!(hub.subscribe(&a, "job-1"), Ok(SubscribeOutcome::Subscribed));
    assert_eq!(
        hub.subscribe(&a, "job-1"),
        Ok(SubscribeOutcome::AlreadySubscribed)
    );
    assert_eq!(metrics.subscriptions_current.get(), 1);

    assert!(hub.unsubscribe(&a, "job-1"));
    assert!(!hub.unsubscribe(&a, "job-1"));
    assert_eq!(metrics.subscriptions_current.get(), 0);
}

#[tokio::test]
async fn test_connect_during_shutdown_is_rejected() {
    let mut config = config();
    config.dispatch.send_timeout = Duration::from_secs(600);
    let (hub, transport, metrics) = setup(config);
    let stuck = hub.connect(Arc::new(StalledSink), None).unwrap();
    hub.subscribe(&stuck, "job-1").unwrap();
    wait_until("running", || hub.is_ready()).await;

    // A stuck fan-out keeps shutdown in Stopping until its deadline
    EventPublisher::new(transport.clone(), "websocket")
        .publish("job-1", &json!({"type": "progress"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopping = tokio::spawn({
        let hub = hub.clone();
        async move { hub.shutdown().await }
    });
    wait_until("stopping", || hub.state() == LifecycleState::Stopping).await;

    let (sink, _rx) = ChannelSink::new();
    assert_eq!(
        hub.connect(Arc::new(sink), None).unwrap_err(),
        HubError::ShuttingDown
    );
    assert_eq!(
        metrics
            .connections_rejected_total
            .with_label_values(&["shutting_down"])
            .get(),
        1
    );

    stopping.await.unwrap();
    assert_eq!(hub.state(), LifecycleState::Stopped);
    assert_eq!(hub.registry().connection_count(), 0);
    assert_eq!(hub.task_status(TaskKind::Bridge), TaskStatus::NotStarted);
}

#[tokio::test]
async fn test_restart_backoff_saturates_at_max() {
    let mut config = config();
    config.lifecycle.restart_backoff = Duration::from_secs(u64::MAX - 1);
    config.lifecycle.max_restart_backoff = Duration::MAX;
    let (hub, transport, _) = setup(config);
    let (_conn, _rx) = client(&hub);
    wait_until("running", || hub.is_ready()).await;

    // Doubling would overflow Duration
    transport.sever();
    wait_until("failed", || hub.task_status(TaskKind::Bridge) == TaskStatus::Failed).await;
    assert_eq!(hub.lifecycle.lock().backoff, Duration::MAX);
}
