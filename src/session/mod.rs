//! Client Sessions
//!
//! One receive loop per connection. Client control messages and the
//! heartbeat share the loop, so each connection is a small state machine:
//! it waits for a message, handles subscribe/unsubscribe/pong, pings after
//! an idle period, and ends on close, send failure or a missed pong.
//! Whatever ends the loop, the connection leaves the registry.

use std::fmt;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::hub::Hub;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::SubscribeOutcome;
use crate::transport::Inbound;

mod heartbeat;


pub use heartbeat::{Heartbeat, HeartbeatAction, Phase};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed the transport
    ClientClosed,
    /// Server closed the connection (eviction or shutdown)
    Closed,
    /// No answer to a ping in time
    HeartbeatTimeout,
    /// Writing a reply or ping failed
    SendFailed,
}

impl SessionEnd {
    /// Label used for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::Closed => "closed",
            SessionEnd::HeartbeatTimeout => "heartbeat_timeout",
            SessionEnd::SendFailed => "send_failed",
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

pub(crate) struct Session {
    hub: Arc<Hub>,
    conn: Arc<Connection>,
}

impl Session {
    pub(crate) fn new(hub: Arc<Hub>, conn: Arc<Connection>) -> Self {
        Self { hub, conn }
    }

    /// Drive the connection until it ends, then evict it.
    pub(crate) async fn run<S>(self, mut inbound: S) -> SessionEnd
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let settings = &self.hub.config().heartbeat;
        let mut heartbeat = Heartbeat::new(
            settings.idle_interval,
            settings.pong_timeout,
            Instant::now(),
        );

        let end = loop {
            tokio::select! {
                biased;

                _ = self.conn.closed() => break SessionEnd::Closed,

                item = inbound.next() => {
                    let Some(item) = item else {
                        break SessionEnd::ClientClosed;
                    };
                    heartbeat.on_activity(Instant::now());
                    if let Err(end) = self.handle(item).await {
                        break end;
                    }
                }

                _ = sleep_until(heartbeat.deadline()) => {
                    match heartbeat.on_deadline(Instant::now(), self.conn.last_pong()) {
                        HeartbeatAction::SendPing => {
                            debug!(conn = %self.conn.id(), "Sending ping");
                            if self.conn.send_message(&ServerMessage::Ping).await.is_err() {
                                break SessionEnd::SendFailed;
                            }
                        }
                        HeartbeatAction::Answered => {
                            debug!(conn = %self.conn.id(), "Pong recorded, connection alive");
                        }
                        HeartbeatAction::Expired => {
                            info!(conn = %self.conn.id(), "Heartbeat timeout - disconnecting");
                            if let Some(m) = self.hub.metrics() {
                                m.heartbeat_timeout();
                            }
                            break SessionEnd::HeartbeatTimeout;
                        }
                    }
                }
            }
        };

        self.hub.evict(&self.conn, end.reason()).await;
        end
    }

    async fn handle(&self, item: Inbound) -> Result<(), SessionEnd> {
        let text = match item {
            Inbound::Activity => return Ok(()),
            Inbound::Invalid(reason) => return self.reply(&ServerMessage::error(reason)).await,
            Inbound::Text(text) => text,
        };

        let message = match ClientMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn = %self.conn.id(), "Rejected client message: {}", e);
                return self.reply(&ServerMessage::error(e)).await;
            }
        };

        match message {
            ClientMessage::Subscribe { channel } => match self.hub.subscribe(&self.conn, &channel) {
                Ok(SubscribeOutcome::Subscribed) | Ok(SubscribeOutcome::AlreadySubscribed) => {
                    self.reply(&ServerMessage::Subscribed { channel }).await
                }
                Ok(SubscribeOutcome::LimitReached) => {
                    let limit = self.hub.config().limits.max_subscriptions_per_connection;
                    self.reply(&ServerMessage::error(ProtocolError::TooManySubscriptions(limit)))
                        .await
                }
                // Evicted concurrently; the closed branch ends the loop
                Ok(SubscribeOutcome::UnknownConnection) => Err(SessionEnd::Closed),
                Err(e) => self.reply(&ServerMessage::error(e)).await,
            },
            ClientMessage::Unsubscribe { channel } => {
                self.hub.unsubscribe(&self.conn, &channel);
                self.reply(&ServerMessage::Unsubscribed { channel }).await
            }
            ClientMessage::Pong => {
                self.conn.record_pong();
                Ok(())
            }
        }
    }

    async fn reply(&self, message: &ServerMessage) -> Result<(), SessionEnd> {
        self.conn
            .send_message(message)
            .await
            .map_err(|_| SessionEnd::SendFailed)
    }
}
