//! Background task lifecycle state

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::SharedQueue;
use crate::protocol::Event;

/// State of the event pipeline as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No background tasks
    Stopped,
    /// Tasks spawned, bridge not yet subscribed
    Starting,
    /// Bridge subscribed and dispatcher running
    Running,
    /// Shutdown in progress
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// State of one background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Running,
    /// Terminated without being asked to
    Failed,
    Stopping,
}

/// The two singleton background tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Bridge,
    Dispatcher,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Bridge => "bridge",
            TaskKind::Dispatcher => "dispatcher",
        }
    }
}

#[derive(Default)]
pub(crate) struct TaskSlot {
    handle: Option<JoinHandle<()>>,
    /// Incremented on every spawn so late exit reports can be ignored
    generation: u64,
    exited: bool,
    /// Handle handed to shutdown
    stopping: bool,
}

impl TaskSlot {
    pub(crate) fn status(&self) -> TaskStatus {
        match &self.handle {
            None if self.stopping => TaskStatus::Stopping,
            None => TaskStatus::NotStarted,
            Some(handle) if self.exited || handle.is_finished() => TaskStatus::Failed,
            Some(_) => TaskStatus::Running,
        }
    }

    pub(crate) fn needs_start(&self) -> bool {
        self.status() != TaskStatus::Running
    }

    /// Generation the next spawn will carry
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn install(&mut self, handle: JoinHandle<()>) {
        self.handle = Some(handle);
        self.exited = false;
    }

    /// Record an unexpected exit; false if the report is stale
    pub(crate) fn mark_exited(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.exited = true;
        true
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.handle.is_some() && !self.exited
    }

    /// Drop a finished handle before respawning
    pub(crate) fn clear(&mut self) {
        self.handle = None;
        self.exited = false;
    }

    /// Hand the handle to shutdown
    pub(crate) fn begin_stop(&mut self) -> Option<JoinHandle<()>> {
        self.stopping = self.handle.is_some();
        self.handle.take()
    }

    pub(crate) fn reset(&mut self) {
        self.handle = None;
        self.exited = false;
        self.stopping = false;
    }
}

pub(crate) struct Lifecycle {
    pub(crate) state: LifecycleState,
    pub(crate) cancel: CancellationToken,
    pub(crate) queue_tx: mpsc::Sender<Event>,
    pub(crate) queue_rx: SharedQueue,
    pub(crate) bridge: TaskSlot,
    pub(crate) dispatcher: TaskSlot,
    /// Delay before the next automatic restart
    pub(crate) backoff: Duration,
    pub(crate) restart_pending: bool,
}

impl Lifecycle {
    pub(crate) fn new(queue_capacity: usize, backoff: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        Self {
            state: LifecycleState::Stopped,
            cancel: CancellationToken::new(),
            queue_tx,
            queue_rx: std::sync::Arc::new(Mutex::new(queue_rx)),
            bridge: TaskSlot::default(),
            dispatcher: TaskSlot::default(),
            backoff,
            restart_pending: false,
        }
    }

    pub(crate) fn slot(&self, kind: TaskKind) -> &TaskSlot {
        match kind {
            TaskKind::Bridge => &self.bridge,
            TaskKind::Dispatcher => &self.dispatcher,
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: TaskKind) -> &mut TaskSlot {
        match kind {
            TaskKind::Bridge => &mut self.bridge,
            TaskKind::Dispatcher => &mut self.dispatcher,
        }
    }

    pub(crate) fn task_status(&self, kind: TaskKind) -> TaskStatus {
        self.slot(kind).status()
    }
}
