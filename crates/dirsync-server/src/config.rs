//! Node configuration
//!
//! One TOML file describes what this process runs: an optional relay and
//! any number of directory server domains. A few settings can be
//! overridden from the environment.
//!
//! ```toml
//! health_interval = 30000
//!
//! [replication_server]
//! server_id = 1
//! listen_addr = "0.0.0.0:8989"
//! db_dir = "./data/changelog"
//! peers = ["rs2.example.com:8989"]
//!
//! [[domain]]
//! base_dn = "dc=example,dc=com"
//! server_id = 11
//! replication_servers = ["127.0.0.1:8989"]
//! state_dir = "./data/state"
//! seed_ldif = "./data/example.ldif"
//! ```

use dirsync_core::config::duration_ms;
use dirsync_core::{ReplicationDomainConfig, ReplicationServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file path variable
pub const ENV_CONFIG: &str = "DIRSYNC_CONFIG";
/// Relay server id override
pub const ENV_SERVER_ID: &str = "DIRSYNC_SERVER_ID";
/// Relay listen address override
pub const ENV_LISTEN: &str = "DIRSYNC_LISTEN";

/// Errors loading the node configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Cannot read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("Invalid value {value:?} for {var}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// Semantically invalid configuration
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A directory server domain served from an in-memory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainNodeConfig {
    /// Replication settings
    #[serde(flatten)]
    pub replication: ReplicationDomainConfig,

    /// LDIF file loaded into the backend at start
    #[serde(default)]
    pub seed_ldif: Option<PathBuf>,
}

/// Everything one node runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Relay, when this node runs one
    pub replication_server: Option<ReplicationServerConfig>,

    /// Directory server domains
    #[serde(rename = "domain")]
    pub domains: Vec<DomainNodeConfig>,

    /// How often health is evaluated and logged
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replication_server: None,
            domains: Vec::new(),
            health_interval: Duration::from_secs(30),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse `path`
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the file named on the command line or by `DIRSYNC_CONFIG`,
    /// apply environment overrides and validate
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let lookup = |var: &str| std::env::var(var).ok();
        let path = resolve_path(cli_path, lookup).ok_or_else(|| {
            ConfigError::Invalid(format!("no configuration file: pass --config or set {}", ENV_CONFIG))
        })?;
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DIRSYNC_SERVER_ID` and `DIRSYNC_LISTEN` to the relay section
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_id = lookup(ENV_SERVER_ID);
        let listen = lookup(ENV_LISTEN);
        if server_id.is_none() && listen.is_none() {
            return Ok(());
        }
        let Some(relay) = self.replication_server.as_mut() else {
            return Err(ConfigError::Invalid(format!(
                "{} and {} need a [replication_server] section",
                ENV_SERVER_ID, ENV_LISTEN
            )));
        };
        if let Some(value) = server_id {
            relay.server_id = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_SERVER_ID,
                value: value.clone(),
            })?;
            tracing::debug!("Relay server id overridden to {}", relay.server_id);
        }
        if let Some(value) = listen {
            relay.listen_addr = value
                .trim()
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::Env {
                    var: ENV_LISTEN,
                    value: value.clone(),
                })?;
            tracing::debug!("Relay listen address overridden to {}", relay.listen_addr);
        }
        Ok(())
    }

    /// Check every section and cross-section constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_server.is_none() && self.domains.is_empty() {
            return Err(ConfigError::Invalid(
                "nothing to run: configure a replication_server or at least one domain".into(),
            ));
        }
        if self.health_interval.is_zero() {
            return Err(ConfigError::Invalid("health_interval must be positive".into()));
        }
        if let Some(relay) = &self.replication_server {
            relay
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("replication_server: {}", e)))?;
        }
        let mut seen = HashSet::new();
        for domain in &self.domains {
            let base_dn = &domain.replication.base_dn;
            domain
                .replication
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("domain {}: {}", base_dn, e)))?;
            if !seen.insert(base_dn.normalized().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "domain {} is configured twice",
                    base_dn
                )));
            }
        }
        Ok(())
    }
}

/// Command line path first, then `DIRSYNC_CONFIG`
pub fn resolve_path<F>(cli_path: Option<&Path>, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    cli_path
        .map(Path::to_path_buf)
        .or_else(|| lookup(ENV_CONFIG).map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
health_interval = 5000

[replication_server]
server_id = 1
listen_addr = "127.0.0.1:8989"
db_dir = "/tmp/dirsync/changelog"
peers = ["127.0.0.1:8990"]

[[domain]]
base_dn = "dc=example,dc=com"
server_id = 11
replication_servers = ["127.0.0.1:8989"]
heartbeat_interval = 2000
seed_ldif = "/tmp/example.ldif"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_parse_sample() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.health_interval, Duration::from_secs(5));
        let relay = config.replication_server.as_ref().unwrap();
        assert_eq!(relay.server_id, 1);
        assert_eq!(relay.peers, vec!["127.0.0.1:8990".to_string()]);
        assert_eq!(config.domains.len(), 1);
        let domain = &config.domains[0];
        assert_eq!(domain.replication.server_id, 11);
        assert_eq!(domain.replication.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(domain.replication.window_size, 100);
        assert_eq!(domain.seed_ldif.as_deref(), Some(Path::new("/tmp/example.ldif")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_relay() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config
            .apply_env_overrides(env(&[(ENV_SERVER_ID, "7"), (ENV_LISTEN, "0.0.0.0:9999")]))
            .unwrap();
        let relay = config.replication_server.unwrap();
        assert_eq!(relay.server_id, 7);
        assert_eq!(relay.listen_addr, "0.0.0.0:9999".parse().unwrap());
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        let err = config
            .apply_env_overrides(env(&[(ENV_SERVER_ID, "seven")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_SERVER_ID, .. }));
    }

    #[test]
    fn test_env_override_needs_relay() {
        let mut config = NodeConfig::default();
        assert!(config.apply_env_overrides(env(&[])).is_ok());
        let err = config
            .apply_env_overrides(env(&[(ENV_LISTEN, "127.0.0.1:1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validation() {
        assert!(NodeConfig::default().validate().is_err());

        let twice = format!(
            "{}\n[[domain]]\nbase_dn = \"DC=Example,DC=Com\"\nserver_id = 12\nreplication_servers = [\"127.0.0.1:8989\"]\n",
            SAMPLE
        );
        let config = NodeConfig::from_toml_str(&twice).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"));

        let bad_id = SAMPLE.replace("server_id = 11", "server_id = 0");
        let config = NodeConfig::from_toml_str(&bad_id).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_resolution() {
        let cli = Path::new("/etc/dirsync.toml");
        assert_eq!(
            resolve_path(Some(cli), env(&[(ENV_CONFIG, "/other.toml")])),
            Some(cli.to_path_buf())
        );
        assert_eq!(
            resolve_path(None, env(&[(ENV_CONFIG, "/other.toml")])),
            Some(PathBuf::from("/other.toml"))
        );
        assert_eq!(resolve_path(None, env(&[])), None);
    }

    #[test]
    fn test_unreadable_file() {
        let err = NodeConfig::from_file(Path::new("/nonexistent/dirsync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
