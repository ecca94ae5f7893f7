//! Session state and identity

use std::fmt;
use std::time::Duration;

use crate::error::ZkError;

/// Lifecycle of a session.
///
/// ```text
/// Init ─► Connecting ◄──► Connected ─► AuthFailed
///              │               │
///              ▼               │
///           Expired            │
///
/// any state ─► Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Connecting,
    Connected,
    Expired,
    AuthFailed,
    Closed,
}

impl SessionState {
    /// No further reconnection will be attempted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Expired | SessionState::AuthFailed | SessionState::Closed
        )
    }

    /// The error every new request gets in this state, if any.
    pub fn rejection(self) -> Option<ZkError> {
        match self {
            SessionState::Expired => Some(ZkError::SessionTimeout),
            SessionState::AuthFailed => Some(ZkError::Authentication),
            SessionState::Closed => Some(ZkError::SessionClosed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Expired => "expired",
            SessionState::AuthFailed => "auth-failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Credentials the cluster assigned to this session.
///
/// Only meaningful while the session is connecting or connected; the
/// session manager drops it on expiry and never presents it again.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: i64,
    password: Vec<u8>,
    pub negotiated_timeout: Duration,
}

impl SessionIdentity {
    pub fn new(session_id: i64, password: Vec<u8>, negotiated_timeout: Duration) -> Self {
        Self {
            session_id,
            password,
            negotiated_timeout,
        }
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// Silence after which the connection is presumed dead.
    pub fn read_timeout(&self) -> Duration {
        self.negotiated_timeout * 2 / 3
    }

    pub fn ping_interval(&self) -> Duration {
        self.negotiated_timeout / 3
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("session_id", &format_args!("{:#x}", self.session_id))
            .field("password", &"<redacted>")
            .field("negotiated_timeout", &self.negotiated_timeout)
            .finish()
    }
}
