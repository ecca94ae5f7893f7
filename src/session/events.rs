//! Event system for session observers
//!
//! Fans session state changes and server notifications out to any number of
//! subscribers. Nothing here resolves pending requests.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::state::SessionState;
use crate::config::PeerAddress;
use crate::proto::{WatcherEvent, SESSION_EVENT_TYPE};

/// Kind of change a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Session,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    Other(i32),
}

impl From<i32> for WatchEventKind {
    fn from(code: i32) -> Self {
        match code {
            SESSION_EVENT_TYPE => WatchEventKind::Session,
            1 => WatchEventKind::NodeCreated,
            2 => WatchEventKind::NodeDeleted,
            3 => WatchEventKind::NodeDataChanged,
            4 => WatchEventKind::NodeChildrenChanged,
            other => WatchEventKind::Other(other),
        }
    }
}

/// A notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchEventKind,
    pub keeper_state: i32,
    pub path: String,
}

impl From<WatcherEvent> for WatchedEvent {
    fn from(event: WatcherEvent) -> Self {
        Self {
            kind: event.event_type.into(),
            keeper_state: event.state,
            path: event.path,
        }
    }
}

/// Session events emitted by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    Established {
        session_id: i64,
        negotiated_timeout: Duration,
        peer: PeerAddress,
        /// True when an existing session was re-established
        renewed: bool,
    },
    /// The server would not re-establish this session; it is gone for good.
    Lost {
        session_id: i64,
    },
    Watch(WatchedEvent),
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Event bus for broadcasting session events
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: SessionEvent) {
        trace!(event = ?event, "Emitting session event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every session event
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { state } => {
                debug!(state = %state, "Session state changed");
            }
            SessionEvent::Established {
                session_id,
                negotiated_timeout,
                peer,
                renewed,
            } => {
                info!(
                    session_id = %format!("{:#x}", session_id),
                    timeout_ms = negotiated_timeout.as_millis() as u64,
                    peer = %peer,
                    renewed = renewed,
                    "Session established"
                );
            }
            SessionEvent::Lost { session_id } => {
                warn!(session_id = %format!("{:#x}", session_id), "Session lost");
            }
            SessionEvent::Watch(event) => {
                debug!(kind = ?event.kind, path = %event.path, "Notification");
            }
        }
    }
}

/// Spawn a background task that feeds every event to `listener`
pub fn spawn_listener(
    event_bus: &EventBus,
    listener: Arc<dyn EventListener>,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, Arc::new(LoggingEventListener))
}
