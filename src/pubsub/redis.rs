//! Redis pub/sub transport
//!
//! Pattern subscriptions use a dedicated pub/sub connection each; publishes
//! share one multiplexed connection opened on first use.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use super::{MessageStream, PubSubTransport, TransportError, TransportMessage};
use crate::config::PubSubConfig;

/// Transport backed by a Redis server
pub struct RedisTransport {
    client: redis::Client,
    connect_timeout: Duration,
    publisher: OnceCell<MultiplexedConnection>,
}

impl RedisTransport {
    /// Validate the URL and check the server is reachable
    pub async fn connect(config: &PubSubConfig) -> Result<Self, TransportError> {
        let client =
            redis::Client::open(config.url.as_str()).map_err(|e| TransportError::Connect(e.to_string()))?;
        let transport = Self {
            client,
            connect_timeout: config.connect_timeout,
            publisher: OnceCell::new(),
        };
        transport.publisher().await?;
        info!(url = %config.url, "Connected to Redis");
        Ok(transport)
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, TransportError> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                match timeout(
                    self.connect_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
                    Err(_) => Err(TransportError::Timeout),
                }
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    fn name(&self) -> &str {
        "redis"
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, TransportError> {
        let mut pubsub = match timeout(self.connect_timeout, self.client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::Timeout),
        };
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(pattern, "Redis pattern subscription open");

        let stream = pubsub.into_on_message().map(|msg| {
            Ok(TransportMessage {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError> {
        let mut conn = self.publisher().await?;
        let receivers: i64 = conn
            .publish(topic, payload.to_vec())
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        Ok(receivers.max(0) as usize)
    }
}
