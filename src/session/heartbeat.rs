//! Heartbeat state machine
//!
//! Pure timing logic for one connection: after `idle_interval` without
//! inbound activity a ping is due; once the ping is sent the client has
//! `pong_timeout` to show any activity before the connection expires. A
//! pong recorded on the connection after the ping also answers it.

use std::time::Duration;

use tokio::time::Instant;

/// Where the connection is in the ping/pong cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for client activity
    Idle,
    /// Ping sent, waiting for the answer
    AwaitingPong,
}

/// What the session must do when the deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    /// A pong arrived after the ping; a new idle period started
    Answered,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    idle_interval: Duration,
    pong_timeout: Duration,
    phase: Phase,
    deadline: Instant,
    pinged_at: Option<Instant>,
}

impl Heartbeat {
    pub fn new(idle_interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            idle_interval,
            pong_timeout,
            phase: Phase::Idle,
            deadline: now + idle_interval,
            pinged_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Any inbound message proves the client is alive
    pub fn on_activity(&mut self, now: Instant) {
        self.phase = Phase::Idle;
        self.deadline = now + self.idle_interval;
        self.pinged_at = None;
    }

    /// `last_pong` is the connection's most recent pong time
    pub fn on_deadline(&mut self, now: Instant, last_pong: Instant) -> HeartbeatAction {
        match (self.phase, self.pinged_at) {
            (Phase::AwaitingPong, Some(pinged_at)) if last_pong >= pinged_at => {
                self.on_activity(last_pong);
                HeartbeatAction::Answered
            }
            (Phase::AwaitingPong, _) => HeartbeatAction::Expired,
            (Phase::Idle, _) => {
                self.phase = Phase::AwaitingPong;
                self.deadline = now + self.pong_timeout;
                self.pinged_at = Some(now);
                HeartbeatAction::SendPing
            }
        }
    }
}
