//! zkclient - Session-oriented client for ZooKeeper-style coordination clusters
//!
//! Connects to a cluster of coordination servers, keeps one session alive
//! across connection loss, and exposes the namespace operations
//! (list, create, read, write) on small versioned data nodes.
//!
//! ## Architecture
//!
//! ```text
//! ZkClient (facade)
//!    │ submit(op, body) ─► waits on its own completion slot
//!    ▼
//! SessionManager ──mpsc──► session task
//!                            ├── ServerSelector   which peer next
//!                            ├── Transport        length-prefixed frames over TCP
//!                            ├── Dispatcher       xid ─► pending request
//!                            └── EventBus         state changes, notifications
//! ```
//!
//! ## Failure Model
//!
//! | Failure | What callers see |
//! |---------|------------------|
//! | Connection drops, reconnect within the session timeout | Nothing; pending operations complete |
//! | No reconnect within the session timeout | `SessionTimeout`, session `Expired` |
//! | Credentials rejected | `Authentication`, session `AuthFailed` |
//! | `close()` | `SessionClosed` for everything outstanding and after |
//! | Node-level rejections | `NoNode`, `NodeExists`, `BadVersion`, ... immediately, never retried |

pub mod client;
pub mod config;
pub mod error;
pub mod path;
pub mod proto;
pub mod session;

// Re-exports
pub use client::{CreateFlags, ZkClient, ANY_VERSION};
pub use config::{AuthConfig, ClientConfig, PeerAddress};
pub use error::ZkError;
pub use proto::{Acl, Stat};
pub use session::{
    Connector, SessionEvent, SessionManager, SessionState, TcpConnector, WatchEventKind,
    WatchedEvent,
};
