//! Configuration for zkclient

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ZkError;

/// A single coordination server, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = ZkError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ZkError::Configuration("empty server entry".into()));
        }

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            // [v6-literal]:port
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| ZkError::Configuration(format!("malformed server entry: {}", entry)))?;
            (host, port)
        } else {
            entry
                .rsplit_once(':')
                .ok_or_else(|| ZkError::Configuration(format!("missing port in server entry: {}", entry)))?
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ZkError::Configuration(format!("invalid host in server entry: {}", entry)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ZkError::Configuration(format!("invalid port in server entry: {}", entry)))?;
        if port == 0 {
            return Err(ZkError::Configuration(format!("port 0 in server entry: {}", entry)));
        }

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = ZkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.to_string()
    }
}

/// Parse a comma separated `host:port` list.
pub fn parse_host_port_spec(spec: &str) -> Result<Vec<PeerAddress>, ZkError> {
    if spec.trim().is_empty() {
        return Err(ZkError::Configuration("server list is empty".into()));
    }
    spec.split(',').map(str::parse).collect()
}

/// Credentials presented after every handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub scheme: String,
    pub credentials: String,
}

impl FromStr for AuthConfig {
    type Err = ZkError;

    /// `scheme:credentials`, e.g. `digest:user:secret`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, credentials) = s
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| ZkError::Configuration(format!("malformed auth spec: {}", s)))?;
        Ok(Self {
            scheme: scheme.to_string(),
            credentials: credentials.to_string(),
        })
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Coordination servers, tried in order unless `deterministic_order` is off
    #[serde(default = "default_servers")]
    pub servers: Vec<PeerAddress>,

    /// Requested session timeout; the server may negotiate it down
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Always try servers in the configured order
    #[serde(default = "default_true")]
    pub deterministic_order: bool,

    /// Bound on one connect + handshake attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Base delay between failed connection attempts
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Largest node value accepted by create/write
    #[serde(default = "default_max_data_size")]
    pub max_data_size: usize,

    /// Capacity of the submit queue
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,

    /// Optional credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

fn default_servers() -> Vec<PeerAddress> {
    vec![PeerAddress::new("127.0.0.1", 2181)]
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

fn default_max_data_size() -> usize {
    1024 * 1024
}

fn default_max_pending_requests() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            session_timeout_ms: default_session_timeout_ms(),
            deterministic_order: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_data_size: default_max_data_size(),
            max_pending_requests: default_max_pending_requests(),
            auth: None,
        }
    }
}

impl ClientConfig {
    /// Default config pointed at the servers in `spec`.
    pub fn from_host_port_spec(spec: &str) -> Result<Self, ZkError> {
        let config = Self {
            servers: parse_host_port_spec(spec)?,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ZkError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ZkError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ZkError::Configuration(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ZkError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ZkError::Configuration(format!("failed to encode config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ZkError::Configuration(format!("failed to write config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ZkError> {
        if self.servers.is_empty() {
            return Err(ZkError::Configuration("server list is empty".into()));
        }
        if self.session_timeout_ms == 0 {
            return Err(ZkError::Configuration("session timeout must be positive".into()));
        }
        if self.session_timeout_ms > i32::MAX as u64 {
            return Err(ZkError::Configuration("session timeout is too large".into()));
        }
        if self.max_data_size == 0 {
            return Err(ZkError::Configuration("max_data_size must be positive".into()));
        }
        if self.max_pending_requests == 0 {
            return Err(ZkError::Configuration("max_pending_requests must be positive".into()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Largest frame the codec accepts: a full value plus header room.
    pub fn max_frame_length(&self) -> usize {
        self.max_data_size.saturating_add(64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.servers, vec![PeerAddress::new("127.0.0.1", 2181)]);
        assert_eq!(config.session_timeout(), Duration::from_secs(10));
        assert!(config.deterministic_order);
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_parse_host_port_spec() {
        let peers = parse_host_port_spec("zk1:2181, zk2:2182 ,[::1]:2183").unwrap();
        assert_eq!(
            peers,
            vec![
                PeerAddress::new("zk1", 2181),
                PeerAddress::new("zk2", 2182),
                PeerAddress::new("::1", 2183),
            ]
        );
        assert_eq!(peers[2].to_string(), "[::1]:2183");
    }

    #[test]
    fn test_malformed_entries_rejected() {
        for spec in ["", "zk1", "zk1:", ":2181", "zk1:2181,,zk2:2181", "zk1:notaport", "zk1:70000", "zk1:0"] {
            assert!(
                matches!(parse_host_port_spec(spec), Err(ZkError::Configuration(_))),
                "spec {:?} should be rejected",
                spec
            );
        }
    }

    #[test]
    fn test_auth_spec() {
        let auth: AuthConfig = "digest:user:secret".parse().unwrap();
        assert_eq!(auth.scheme, "digest");
        assert_eq!(auth.credentials, "user:secret");
        assert!("nocolon".parse::<AuthConfig>().is_err());
        assert!(":creds".parse::<AuthConfig>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());
        config.servers.clear();
        assert!(config.validate().is_err());

        let config = ClientConfig {
            session_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("zkclient.toml");
        std::fs::write(
            &path,
            "servers = [\"zk1:2181\", \"zk2:2181\"]\nsession_timeout_ms = 4000\n",
        )
        .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.session_timeout_ms, 4000);
        assert_eq!(config.connect_timeout_ms, 3000);

        config.save(&path).unwrap();
        let reloaded = ClientConfig::load(&path).unwrap();
        assert_eq!(reloaded.servers, config.servers);
    }

    #[test]
    fn test_load_rejects_bad_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "servers = [\"zk1\"]\n").unwrap();
        assert!(matches!(ClientConfig::load(&path), Err(ZkError::Configuration(_))));
    }
}
