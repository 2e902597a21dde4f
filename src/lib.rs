//! JobPulse - real-time job event fan-out over WebSocket
//!
//! Background jobs publish progress events to a pub/sub transport under
//! `<namespace>:<channel_id>`. JobPulse pattern-subscribes to the whole
//! namespace, queues the events and pushes each one to every WebSocket
//! client subscribed to its channel, in arrival order.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use connection::{ChannelSink, ClientSink, Connection, ConnectionId};
pub use hub::{Hub, HubError, LifecycleState};
pub use metrics::{Metrics, MetricsServer};
pub use pubsub::{EventPublisher, MemoryTransport, PubSubTransport, RedisTransport};
pub use registry::ConnectionRegistry;
pub use server::Server;
