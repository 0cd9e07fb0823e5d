//! Replication configuration
//!
//! Resolved values consumed by [`crate::ReplicationDomain`] and
//! [`crate::ReplicationServer`]. Changing a value means restarting the object
//! that uses it.

use crate::backend::Dn;
use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest server id: CSN text form keeps 4 hex digits for it
pub const MAX_SERVER_ID: i32 = 0x7FFF;

/// Changelog storage implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangelogBackendKind {
    /// One append-only file per replica
    #[default]
    File,
    /// LMDB B-tree
    Lmdb,
}

/// Directory server side configuration of one replicated base DN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationDomainConfig {
    /// Replicated naming context
    pub base_dn: Dn,

    /// This server's id, unique in the topology
    pub server_id: i32,

    /// Replication servers to connect to, `host:port`, tried in rotation
    pub replication_servers: Vec<String>,

    /// Receive window granted to the relay (updates)
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Idle time before a heartbeat is sent
    #[serde(default = "default_heartbeat_interval", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Group id advertised in topology
    #[serde(default = "default_group_id")]
    pub group_id: u8,

    /// Entries an exporter may have in flight before waiting for an ack
    #[serde(default = "default_window_size")]
    pub init_window: u32,

    /// TCP connect plus handshake timeout
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Poll interval of the replay listener
    #[serde(default = "default_receive_timeout", with = "duration_ms")]
    pub receive_timeout: Duration,

    /// Longest a publish may wait for a session and window credit
    #[serde(default = "default_publish_timeout", with = "duration_ms")]
    pub publish_timeout: Duration,

    /// Inactivity limit during a total update
    #[serde(default = "default_total_update_timeout", with = "duration_ms")]
    pub total_update_timeout: Duration,

    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Where ServerState and generation ID are persisted
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Own published updates kept for resend after a reconnect
    #[serde(default = "default_own_log_capacity")]
    pub own_log_capacity: usize,

    /// Persist state every N applied changes
    #[serde(default = "default_state_save_interval")]
    pub state_save_interval: u64,

    /// Remote changes held while the change they depend on is missing
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

/// Replication server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationServerConfig {
    /// This relay's server id
    pub server_id: i32,

    /// Address accepting DS and RS sessions
    pub listen_addr: SocketAddr,

    /// Changelog root directory
    pub db_dir: PathBuf,

    /// Peer replication servers, `host:port`
    #[serde(default)]
    pub peers: Vec<String>,

    /// Receive window granted to each connected server
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Idle time before a heartbeat is sent
    #[serde(default = "default_heartbeat_interval", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Group id advertised in topology
    #[serde(default = "default_group_id")]
    pub group_id: u8,

    /// Changelog implementation
    #[serde(default)]
    pub changelog_backend: ChangelogBackendKind,

    /// Changelog records older than this are purged
    #[serde(default = "default_purge_delay", with = "duration_ms")]
    pub purge_delay: Duration,

    /// How often the purge check runs
    #[serde(default = "default_purge_interval", with = "duration_ms")]
    pub purge_interval: Duration,

    /// Outbound messages buffered per connected server
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Connect plus handshake timeout towards peers
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Peer reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// LMDB map size in bytes
    #[serde(default = "default_lmdb_map_size")]
    pub lmdb_map_size: usize,
}

fn default_window_size() -> u32 {
    100
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_group_id() -> u8 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_total_update_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_own_log_capacity() -> usize {
    10_000
}

fn default_state_save_interval() -> u64 {
    100
}

fn default_pending_capacity() -> usize {
    1_000
}

fn default_purge_delay() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_lmdb_map_size() -> usize {
    1024 * 1024 * 1024
}

fn check_server_id(server_id: i32) -> Result<(), String> {
    if !(1..=MAX_SERVER_ID).contains(&server_id) {
        return Err(format!(
            "server_id must be between 1 and {}, got {}",
            MAX_SERVER_ID, server_id
        ));
    }
    Ok(())
}

fn check_addresses(addresses: &[String], what: &str) -> Result<(), String> {
    for address in addresses {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(format!("{} entry {:?} is not host:port", what, address)),
        }
    }
    Ok(())
}

impl ReplicationDomainConfig {
    /// Configuration with defaults for everything but identity and relays
    pub fn new(base_dn: Dn, server_id: i32, replication_servers: Vec<String>) -> Self {
        Self {
            base_dn,
            server_id,
            replication_servers,
            window_size: default_window_size(),
            heartbeat_interval: default_heartbeat_interval(),
            group_id: default_group_id(),
            init_window: default_window_size(),
            connect_timeout: default_connect_timeout(),
            receive_timeout: default_receive_timeout(),
            publish_timeout: default_publish_timeout(),
            total_update_timeout: default_total_update_timeout(),
            backoff: BackoffConfig::default(),
            state_dir: None,
            own_log_capacity: default_own_log_capacity(),
            state_save_interval: default_state_save_interval(),
            pending_capacity: default_pending_capacity(),
        }
    }

    /// Set the receive window
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the group id
    pub fn with_group_id(mut self, group_id: u8) -> Self {
        self.group_id = group_id;
        self
    }

    /// Set the bulk-transfer window
    pub fn with_init_window(mut self, init_window: u32) -> Self {
        self.init_window = init_window;
        self
    }

    /// Set the publish timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set the total update inactivity timeout
    pub fn with_total_update_timeout(mut self, timeout: Duration) -> Self {
        self.total_update_timeout = timeout;
        self
    }

    /// Set the reconnect backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Persist state under `dir`
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the own-change log capacity
    pub fn with_own_log_capacity(mut self, capacity: usize) -> Self {
        self.own_log_capacity = capacity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        check_server_id(self.server_id)?;
        if self.base_dn.is_root() {
            return Err("base_dn must not be the root DN".into());
        }
        if self.replication_servers.is_empty() {
            return Err("at least one replication server is required".into());
        }
        check_addresses(&self.replication_servers, "replication_servers")?;
        if self.window_size == 0 {
            return Err("window_size must be at least 1".into());
        }
        if self.init_window == 0 {
            return Err("init_window must be at least 1".into());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be positive".into());
        }
        if self.receive_timeout.is_zero() {
            return Err("receive_timeout must be positive".into());
        }
        if self.own_log_capacity == 0 {
            return Err("own_log_capacity must be at least 1".into());
        }
        if self.state_save_interval == 0 {
            return Err("state_save_interval must be at least 1".into());
        }
        if self.pending_capacity == 0 {
            return Err("pending_capacity must be at least 1".into());
        }
        Ok(())
    }
}

impl ReplicationServerConfig {
    /// Configuration with defaults for everything but identity and storage
    pub fn new(server_id: i32, listen_addr: SocketAddr, db_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_id,
            listen_addr,
            db_dir: db_dir.into(),
            peers: Vec::new(),
            window_size: default_window_size(),
            heartbeat_interval: default_heartbeat_interval(),
            group_id: default_group_id(),
            changelog_backend: ChangelogBackendKind::default(),
            purge_delay: default_purge_delay(),
            purge_interval: default_purge_interval(),
            queue_capacity: default_queue_capacity(),
            connect_timeout: default_connect_timeout(),
            backoff: BackoffConfig::default(),
            lmdb_map_size: default_lmdb_map_size(),
        }
    }

    /// Set peer relays
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// Set the changelog implementation
    pub fn with_changelog_backend(mut self, kind: ChangelogBackendKind) -> Self {
        self.changelog_backend = kind;
        self
    }

    /// Set the receive window
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the purge delay
    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay = delay;
        self
    }

    /// Set the reconnect backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        check_server_id(self.server_id)?;
        check_addresses(&self.peers, "peers")?;
        if self.window_size == 0 {
            return Err("window_size must be at least 1".into());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be positive".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".into());
        }
        if self.purge_interval.is_zero() {
            return Err("purge_interval must be positive".into());
        }
        if self.db_dir.as_os_str().is_empty() {
            return Err("db_dir must be set".into());
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_dn() -> Dn {
        Dn::parse("dc=example,dc=com").unwrap()
    }

    #[test]
    fn test_default_domain_config() {
        let config = ReplicationDomainConfig::new(base_dn(), 1, vec!["127.0.0.1:8989".into()]);
        assert_eq!(config.window_size, 100);
        assert_eq!(config.group_id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_domain_config_rejects_bad_values() {
        let ok = ReplicationDomainConfig::new(base_dn(), 1, vec!["localhost:8989".into()]);
        assert!(ok.validate().is_ok());

        let mut config = ok.clone();
        config.server_id = 0;
        assert!(config.validate().is_err());

        let config = ok.clone().with_window_size(0);
        assert!(config.validate().is_err());

        let mut config = ok.clone();
        config.replication_servers = vec!["no-port".into()];
        assert!(config.validate().is_err());

        let mut config = ok.clone();
        config.replication_servers.clear();
        assert!(config.validate().is_err());

        let mut config = ok.clone();
        config.pending_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ok;
        config.base_dn = Dn::root();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8989".parse().unwrap();
        let config = ReplicationServerConfig::new(10, addr, "/tmp/rs")
            .with_peers(vec!["127.0.0.1:8990".into()])
            .with_changelog_backend(ChangelogBackendKind::Lmdb);
        assert_eq!(config.changelog_backend, ChangelogBackendKind::Lmdb);
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.server_id = MAX_SERVER_ID + 1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_server_config_from_json_uses_defaults() {
        let json = r#"{
            "server_id": 3,
            "listen_addr": "127.0.0.1:9000",
            "db_dir": "/var/lib/dirsync",
            "changelog_backend": "lmdb",
            "purge_delay": 1500
        }"#;
        let config: ReplicationServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.changelog_backend, ChangelogBackendKind::Lmdb);
        assert_eq!(config.purge_delay, Duration::from_millis(1500));
        assert_eq!(config.queue_capacity, 10_000);
    }
}
