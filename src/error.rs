//! Error types for zkclient
//!
//! Every public operation returns exactly one of these variants. Wire-level
//! result codes are folded into the same enum by [`check_result_code`].

use thiserror::Error;

/// Result codes carried in reply headers.
pub mod codes {
    pub const OK: i32 = 0;
    pub const SYSTEM_ERROR: i32 = -1;
    pub const RUNTIME_INCONSISTENCY: i32 = -2;
    pub const DATA_INCONSISTENCY: i32 = -3;
    pub const CONNECTION_LOSS: i32 = -4;
    pub const MARSHALLING_ERROR: i32 = -5;
    pub const UNIMPLEMENTED: i32 = -6;
    pub const OPERATION_TIMEOUT: i32 = -7;
    pub const BAD_ARGUMENTS: i32 = -8;
    pub const INVALID_STATE: i32 = -9;
    pub const NO_NODE: i32 = -101;
    pub const NO_AUTH: i32 = -102;
    pub const BAD_VERSION: i32 = -103;
    pub const NO_CHILDREN_FOR_EPHEMERALS: i32 = -108;
    pub const NODE_EXISTS: i32 = -110;
    pub const NOT_EMPTY: i32 = -111;
    pub const SESSION_EXPIRED: i32 = -112;
    pub const INVALID_ACL: i32 = -114;
    pub const AUTH_FAILED: i32 = -115;
    pub const CLOSING: i32 = -116;
    pub const SESSION_MOVED: i32 = -118;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session timed out without reconnecting")]
    SessionTimeout,

    #[error("Authentication failed")]
    Authentication,

    #[error("Session is closed")]
    SessionClosed,

    #[error("The node does not exist")]
    NoNode,

    #[error("The node already exists")]
    NodeExists,

    #[error("Cannot create children of ephemeral nodes")]
    NoChildrenForEphemerals,

    #[error("Expected version does not match actual version")]
    BadVersion,

    #[error("Invalid ACL specified")]
    InvalidAcl,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {message}")]
    Protocol { code: Option<i32>, message: String },
}

impl ZkError {
    /// A framing or decoding violation with no wire code attached.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: None,
            message: message.into(),
        }
    }

    /// Errors the session layer absorbs by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ZkError::Connection(_) | ZkError::Protocol { code: None, .. }
        )
    }

    /// Errors after which the session can never be used again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ZkError::SessionTimeout | ZkError::Authentication | ZkError::SessionClosed
        )
    }

    /// The raw wire code, when this error came from one.
    pub fn raw_code(&self) -> Option<i32> {
        match self {
            ZkError::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}

/// Translate a reply result code into success or a typed failure.
///
/// Unrecognized codes are never dropped: they surface as
/// [`ZkError::Protocol`] carrying the raw value.
pub fn check_result_code(code: i32) -> Result<(), ZkError> {
    translate(code).unwrap_or_else(|| {
        Err(wire_error(code, &format!("unknown error returned from server: {}", code)))
    })
}

/// Whether `code` is one a server is known to send.
pub fn is_known_code(code: i32) -> bool {
    translate(code).is_some()
}

fn translate(code: i32) -> Option<Result<(), ZkError>> {
    use codes::*;

    let err = match code {
        OK => return Some(Ok(())),
        NO_NODE => ZkError::NoNode,
        NODE_EXISTS => ZkError::NodeExists,
        NO_CHILDREN_FOR_EPHEMERALS => ZkError::NoChildrenForEphemerals,
        BAD_VERSION => ZkError::BadVersion,
        INVALID_ACL => ZkError::InvalidAcl,
        BAD_ARGUMENTS => ZkError::InvalidArgument("server rejected the request arguments".into()),
        CONNECTION_LOSS => ZkError::Connection("server reported connection loss".into()),
        OPERATION_TIMEOUT => ZkError::Connection("server reported an operation timeout".into()),
        SESSION_EXPIRED => ZkError::SessionTimeout,
        AUTH_FAILED | NO_AUTH => ZkError::Authentication,
        INVALID_STATE | CLOSING => ZkError::SessionClosed,
        SYSTEM_ERROR => wire_error(code, "server system error"),
        RUNTIME_INCONSISTENCY => wire_error(code, "runtime inconsistency"),
        DATA_INCONSISTENCY => wire_error(code, "data inconsistency"),
        MARSHALLING_ERROR => wire_error(code, "failed to marshall a request"),
        UNIMPLEMENTED => wire_error(code, "operation is unimplemented"),
        NOT_EMPTY => wire_error(code, "node has children"),
        SESSION_MOVED => wire_error(code, "session moved to another server"),
        _ => return None,
    };
    Some(Err(err))
}

fn wire_error(code: i32, message: &str) -> ZkError {
    ZkError::Protocol {
        code: Some(code),
        message: message.to_string(),
    }
}
