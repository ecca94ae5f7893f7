//! Session Layer
//!
//! Keeps one logical session alive against a cluster of coordination servers.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `transport`  | Connect to one peer, send/receive length-prefixed frames |
//! | `selector`   | Which peer to try next                                |
//! | `dispatcher` | Correlate replies with pending requests               |
//! | `state`      | Session lifecycle and the identity the cluster issued |
//! | `events`     | Fan state changes and notifications out to observers  |
//! | `manager`    | The background task that owns all of the above        |
//!
//! # Key Design Principles
//!
//! ## 1. One Writer
//!
//! - Only the session task touches the transport, the session state and the
//!   pending table
//! - Callers talk to it over a channel and wait on their own oneshot slot
//!
//! ## 2. Connection Loss Is Not an Error
//!
//! - A dropped connection sends the session back to `Connecting`
//! - Pending requests survive and are resent after re-establishment
//! - Only the session timeout turns connection loss into a caller-visible error
//!
//! ## 3. Terminal Means Terminal
//!
//! - `Expired`, `AuthFailed` and `Closed` never reconnect
//! - A session id is never presented again once the session expired

mod dispatcher;
mod manager;
mod selector;
mod state;

pub mod events;
pub mod transport;

pub use events::{
    spawn_listener, spawn_logging_listener, EventBus, EventListener, LoggingEventListener,
    SessionEvent, WatchEventKind, WatchedEvent,
};
pub use manager::SessionManager;
pub use selector::ServerSelector;
pub use state::{SessionIdentity, SessionState};
pub use transport::{ByteStream, Connector, TcpConnector};
