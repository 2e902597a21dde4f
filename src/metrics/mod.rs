//! Prometheus metrics for JobPulse
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Every component takes an `Option<Arc<Metrics>>`, so the service runs
//! unchanged with metrics disabled.

use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::{MetricsServer, ReadinessCheck};

/// All JobPulse metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_maximum: IntGauge,
    pub connections_rejected_total: IntCounterVec,
    pub connections_evicted_total: IntCounterVec,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,
    pub unsubscriptions_total: IntCounter,

    // Event metrics
    pub events_received: IntCounter,
    pub events_dropped: IntCounter,
    pub events_discarded: IntCounter,
    pub events_delivered: IntCounter,
    pub send_failures: IntCounter,

    // Heartbeat metrics
    pub heartbeat_timeouts: IntCounter,

    // Background task metrics
    pub task_restarts: IntCounterVec,

    // Performance metrics
    pub queue_latency: Histogram,
    pub fanout_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::with_opts(Opts::new(
            "jobpulse_connections_total",
            "Total number of client connections since startup",
        ))
        .unwrap();

        let connections_current = IntGauge::with_opts(Opts::new(
            "jobpulse_connections_current",
            "Current number of connected clients",
        ))
        .unwrap();

        let connections_maximum = IntGauge::with_opts(Opts::new(
            "jobpulse_connections_maximum",
            "Maximum concurrent connections since startup",
        ))
        .unwrap();

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "jobpulse_connections_rejected_total",
                "Total connections rejected before registration",
            ),
            &["reason"],
        )
        .unwrap();

        let connections_evicted_total = IntCounterVec::new(
            Opts::new(
                "jobpulse_connections_evicted_total",
                "Total connections removed from the registry by cause",
            ),
            &["reason"],
        )
        .unwrap();

        // Subscription metrics
        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "jobpulse_subscriptions_current",
            "Current number of connection/channel subscriptions",
        ))
        .unwrap();

        let subscriptions_total = IntCounter::with_opts(Opts::new(
            "jobpulse_subscriptions_total",
            "Total subscriptions created since startup",
        ))
        .unwrap();

        let unsubscriptions_total = IntCounter::with_opts(Opts::new(
            "jobpulse_unsubscriptions_total",
            "Total explicit unsubscriptions since startup",
        ))
        .unwrap();

        // Event metrics
        let events_received = IntCounter::with_opts(Opts::new(
            "jobpulse_events_received_total",
            "Events decoded from the pub/sub transport",
        ))
        .unwrap();

        let events_dropped = IntCounter::with_opts(Opts::new(
            "jobpulse_events_dropped_total",
            "Inbound messages dropped because they could not be decoded",
        ))
        .unwrap();

        let events_discarded = IntCounter::with_opts(Opts::new(
            "jobpulse_events_discarded_total",
            "Events discarded because their channel had no subscribers",
        ))
        .unwrap();

        let events_delivered = IntCounter::with_opts(Opts::new(
            "jobpulse_events_delivered_total",
            "Per-subscriber event deliveries",
        ))
        .unwrap();

        let send_failures = IntCounter::with_opts(Opts::new(
            "jobpulse_send_failures_total",
            "Per-subscriber event sends that failed",
        ))
        .unwrap();

        let heartbeat_timeouts = IntCounter::with_opts(Opts::new(
            "jobpulse_heartbeat_timeouts_total",
            "Connections closed for not answering a ping",
        ))
        .unwrap();

        let task_restarts = IntCounterVec::new(
            Opts::new(
                "jobpulse_task_restarts_total",
                "Background task restarts after unexpected termination",
            ),
            &["task"],
        )
        .unwrap();

        // Performance metrics
        let queue_latency = Histogram::with_opts(
            HistogramOpts::new(
                "jobpulse_queue_latency_seconds",
                "Time from decoding an event to the start of its fan-out",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();

        let fanout_duration = Histogram::with_opts(
            HistogramOpts::new(
                "jobpulse_fanout_duration_seconds",
                "Time to deliver one event to all of its subscribers",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_current.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_maximum.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_rejected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_evicted_total.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_current.clone()))
            .unwrap();
        registry
            .register(Box::new(subscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(unsubscriptions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(events_received.clone()))
            .unwrap();
        registry
            .register(Box::new(events_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(events_discarded.clone()))
            .unwrap();
        registry
            .register(Box::new(events_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(send_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(heartbeat_timeouts.clone()))
            .unwrap();
        registry
            .register(Box::new(task_restarts.clone()))
            .unwrap();
        registry
            .register(Box::new(queue_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(fanout_duration.clone()))
            .unwrap();

        Metrics {
            registry,
            connections_total,
            connections_current,
            connections_maximum,
            connections_rejected_total,
            connections_evicted_total,
            subscriptions_current,
            subscriptions_total,
            unsubscriptions_total,
            events_received,
            events_dropped,
            events_discarded,
            events_delivered,
            send_failures,
            heartbeat_timeouts,
            task_restarts,
            queue_latency,
            fanout_duration,
        }
    }

    // Helper methods for common operations

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
        // Update maximum if current exceeds it
        let current = self.connections_current.get();
        let max = self.connections_maximum.get();
        if current > max {
            self.connections_maximum.set(current);
        }
    }

    /// A registered connection left; `subscriptions` is how many it held
    pub fn client_removed(&self, reason: &str, subscriptions: usize) {
        self.connections_current.dec();
        self.subscriptions_current.sub(subscriptions as i64);
        self.connections_evicted_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_current.dec();
        self.unsubscriptions_total.inc();
    }

    pub fn event_received(&self) {
        self.events_received.inc();
    }

    pub fn event_dropped(&self) {
        self.events_dropped.inc();
    }

    pub fn event_discarded(&self) {
        self.events_discarded.inc();
    }

    /// Record the outcome of one fan-out
    pub fn event_fanned_out(&self, delivered: usize, failed: usize, elapsed: Duration) {
        self.events_delivered.inc_by(delivered as u64);
        self.send_failures.inc_by(failed as u64);
        self.fanout_duration.observe(elapsed.as_secs_f64());
    }

    pub fn observe_queue_latency(&self, waited: Duration) {
        self.queue_latency.observe(waited.as_secs_f64());
    }

    pub fn heartbeat_timeout(&self) {
        self.heartbeat_timeouts.inc();
    }

    pub fn task_restarted(&self, task: &str) {
        self.task_restarts.with_label_values(&[task]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
