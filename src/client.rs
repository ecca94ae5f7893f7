//! Operation facade
//!
//! `ZkClient` is what applications hold. Each operation validates its input,
//! builds one request, hands it to the session and decodes the reply.

use bytes::Bytes;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ZkError;
use crate::path::validate_path;
use crate::proto::{
    self, Acl, CreateRequest, CreateResponse, GetChildrenResponse, GetDataResponse, OpCode,
    PathWatchRequest, SetDataRequest, SetDataResponse, Stat,
};
use crate::session::{Connector, SessionEvent, SessionManager, SessionState, TcpConnector};

/// Version sentinel that skips the optimistic check on `write`.
pub const ANY_VERSION: i32 = -1;

/// How a node is created.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CreateFlags(i32);

impl CreateFlags {
    pub const PERSISTENT: CreateFlags = CreateFlags(0);
    /// Removed by the server when the creating session ends
    pub const EPHEMERAL: CreateFlags = CreateFlags(1);
    /// Server appends a zero-padded counter unique among siblings
    pub const SEQUENTIAL: CreateFlags = CreateFlags(2);

    const KNOWN: i32 = Self::EPHEMERAL.0 | Self::SEQUENTIAL.0;

    pub fn from_bits(bits: i32) -> Result<Self, ZkError> {
        if bits & !Self::KNOWN != 0 {
            return Err(ZkError::InvalidArgument(format!("unknown create flags: {:#x}", bits)));
        }
        Ok(CreateFlags(bits))
    }

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn is_ephemeral(self) -> bool {
        self.0 & Self::EPHEMERAL.0 != 0
    }

    pub fn is_sequential(self) -> bool {
        self.0 & Self::SEQUENTIAL.0 != 0
    }
}

impl BitOr for CreateFlags {
    type Output = CreateFlags;

    fn bitor(self, rhs: CreateFlags) -> CreateFlags {
        CreateFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CreateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_ephemeral(), self.is_sequential()) {
            (false, false) => f.write_str("PERSISTENT"),
            (true, false) => f.write_str("EPHEMERAL"),
            (false, true) => f.write_str("SEQUENTIAL"),
            (true, true) => f.write_str("EPHEMERAL | SEQUENTIAL"),
        }
    }
}

/// Client for a coordination service cluster.
///
/// # Example
///
/// ```ignore
/// use zkclient::{CreateFlags, ZkClient};
///
/// let client = ZkClient::new("zk1:2181,zk2:2181,zk3:2181")?;
/// let path = client.create("/jobs/job-", b"payload", CreateFlags::SEQUENTIAL).await?;
/// let (value, version) = client.read(&path).await?;
/// client.write(&path, b"done", version).await?;
/// client.close().await?;
/// ```
#[derive(Clone)]
pub struct ZkClient {
    session: SessionManager,
    max_data_size: usize,
}

impl ZkClient {
    /// Connect to the comma separated `host:port` list with default settings.
    ///
    /// Returns once the session task is running; the first operation waits
    /// for the handshake.
    pub fn new(host_port_spec: &str) -> Result<Self, ZkError> {
        Self::with_config(ClientConfig::from_host_port_spec(host_port_spec)?)
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, ZkError> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Use a custom connection factory.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self, ZkError> {
        let max_data_size = config.max_data_size;
        let session = SessionManager::start(config, connector)?;
        Ok(Self {
            session,
            max_data_size,
        })
    }

    /// Names of the children of `path`, in server order.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, ZkError> {
        validate_path(path, false)?;
        let request = PathWatchRequest {
            path: path.to_string(),
            watch: false,
        };
        let reply = self.call(OpCode::GetChildren, &request).await?;
        let response: GetChildrenResponse = proto::decode(reply)?;
        Ok(response.children)
    }

    /// Create a node open to everyone. Returns the path actually created.
    pub async fn create(&self, path: &str, value: &[u8], flags: CreateFlags) -> Result<String, ZkError> {
        self.create_with_acl(path, value, Acl::open_unsafe(), flags).await
    }

    pub async fn create_with_acl(
        &self,
        path: &str,
        value: &[u8],
        acl: Vec<Acl>,
        flags: CreateFlags,
    ) -> Result<String, ZkError> {
        validate_path(path, flags.is_sequential())?;
        self.check_size(value)?;
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }

        let request = CreateRequest {
            path: path.to_string(),
            data: value.to_vec(),
            acl,
            flags: flags.bits(),
        };
        let reply = self.call(OpCode::Create, &request).await?;
        let response: CreateResponse = proto::decode(reply)?;
        debug!(requested = %path, created = %response.path, flags = ?flags, "Node created");
        Ok(response.path)
    }

    /// Value and version of `path`.
    pub async fn read(&self, path: &str) -> Result<(Vec<u8>, i32), ZkError> {
        let (data, stat) = self.read_with_stat(path).await?;
        Ok((data, stat.version))
    }

    pub async fn read_with_stat(&self, path: &str) -> Result<(Vec<u8>, Stat), ZkError> {
        validate_path(path, false)?;
        let request = PathWatchRequest {
            path: path.to_string(),
            watch: false,
        };
        let reply = self.call(OpCode::GetData, &request).await?;
        let response: GetDataResponse = proto::decode(reply)?;
        Ok((response.data, response.stat))
    }

    /// Replace the value of `path`.
    ///
    /// `expected_version` must match the node's current version, or be
    /// [`ANY_VERSION`]. A mismatch fails with `BadVersion` and is never
    /// retried.
    pub async fn write(&self, path: &str, data: &[u8], expected_version: i32) -> Result<(), ZkError> {
        validate_path(path, false)?;
        self.check_size(data)?;
        if expected_version < ANY_VERSION {
            return Err(ZkError::InvalidArgument(format!(
                "expected version must be -1 or non-negative, got {}",
                expected_version
            )));
        }

        let request = SetDataRequest {
            path: path.to_string(),
            data: data.to_vec(),
            version: expected_version,
        };
        let reply = self.call(OpCode::SetData, &request).await?;
        let response: SetDataResponse = proto::decode(reply)?;
        debug!(path = %path, version = response.stat.version, "Node written");
        Ok(())
    }

    /// End the session. Idempotent; outstanding operations fail with
    /// `SessionClosed`.
    pub async fn close(&self) -> Result<(), ZkError> {
        self.session.close().await
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session.session_id()
    }

    pub fn negotiated_timeout(&self) -> Option<Duration> {
        self.session.negotiated_timeout()
    }

    /// Session state changes and server notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ZkError> {
        self.session.wait_for_state(SessionState::Connected, timeout).await
    }

    async fn call<R: proto::Record>(&self, op: OpCode, request: &R) -> Result<Bytes, ZkError> {
        self.session.submit(op, proto::encode(request)).await
    }

    fn check_size(&self, value: &[u8]) -> Result<(), ZkError> {
        if value.len() > self.max_data_size {
            return Err(ZkError::InvalidArgument(format!(
                "value of {} bytes exceeds the {} byte limit",
                value.len(),
                self.max_data_size
            )));
        }
        Ok(())
    }
}
