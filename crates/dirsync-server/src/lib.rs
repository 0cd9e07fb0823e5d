//! dirsync node bootstrap
//!
//! Starts what a [`NodeConfig`] describes:
//! - An optional replication server (relay)
//! - Directory server domains over in-memory backends, optionally seeded
//!   from LDIF
//! - A periodic health check that logs status transitions
//!
//! Started objects are kept in explicit registries owned by the [`Node`].

pub mod config;

pub use config::{ConfigError, DomainNodeConfig, NodeConfig};

use anyhow::Context;
use dirsync_core::monitor::{
    DomainHealthCheck, HealthMonitor, HealthReport, HealthStatus, RelayHealthCheck,
};
use dirsync_core::registry::{DomainRegistry, ReplicationServerRegistry};
use dirsync_core::{Entry, MemoryBackend, ReplicationDomain, ReplicationServer};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running node
pub struct Node {
    servers: ReplicationServerRegistry,
    domains: DomainRegistry,
    health: Arc<HealthMonitor>,
    health_task: Option<JoinHandle<()>>,
}

impl Node {
    /// Start everything `config` describes
    ///
    /// On failure whatever already started is stopped again.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let mut node = Self {
            servers: ReplicationServerRegistry::new(),
            domains: DomainRegistry::new(),
            health: Arc::new(HealthMonitor::new(config.health_interval)),
            health_task: None,
        };
        if let Err(e) = node.start_components(&config).await {
            node.shutdown();
            return Err(e);
        }
        node.health_task = Some(spawn_health_logger(node.health.clone(), config.health_interval));
        info!(
            "Node started: {} replication server(s), {} domain(s)",
            node.servers.len(),
            node.domains.len()
        );
        Ok(node)
    }

    async fn start_components(&mut self, config: &NodeConfig) -> anyhow::Result<()> {
        if let Some(relay_config) = &config.replication_server {
            let relay = ReplicationServer::start(relay_config.clone())
                .await
                .with_context(|| {
                    format!("starting replication server {}", relay_config.server_id)
                })?;
            self.servers.register(relay.clone())?;
            self.health.add_check(Box::new(RelayHealthCheck::new(relay)));
        }
        for domain_config in &config.domains {
            let domain = start_domain(domain_config).with_context(|| {
                format!("starting domain {}", domain_config.replication.base_dn)
            })?;
            self.domains.register(domain.clone())?;
            self.health.add_check(Box::new(DomainHealthCheck::new(domain)));
        }
        Ok(())
    }

    /// Running relays
    pub fn servers(&self) -> &ReplicationServerRegistry {
        &self.servers
    }

    /// Running domains
    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    /// Evaluate health now
    pub fn health(&self) -> HealthReport {
        self.health.check_health()
    }

    /// Stop domains first, then relays
    pub fn shutdown(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        for domain in self.domains.list() {
            domain.stop();
            self.domains.deregister(domain.base_dn());
        }
        for relay in self.servers.list() {
            relay.stop();
            self.servers.deregister(relay.server_id());
        }
        info!("Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.domains.is_empty() || !self.servers.is_empty() {
            self.shutdown();
        }
    }
}

fn start_domain(config: &DomainNodeConfig) -> anyhow::Result<Arc<ReplicationDomain>> {
    let backend = match &config.seed_ldif {
        Some(path) => {
            let entries = load_ldif(path)?;
            info!(
                "Seeding {} with {} entries from {}",
                config.replication.base_dn,
                entries.len(),
                path.display()
            );
            MemoryBackend::with_entries(entries)
        }
        None => MemoryBackend::new(),
    };
    let domain = ReplicationDomain::new(config.replication.clone(), Arc::new(backend))?;
    domain.start()?;
    Ok(domain)
}

/// Parse an LDIF file of blank-line separated records
pub fn load_ldif(path: &Path) -> anyhow::Result<Vec<Entry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_ldif(&content).with_context(|| format!("parsing {}", path.display()))
}

fn parse_ldif(content: &str) -> dirsync_core::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut record = String::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !record.trim().is_empty() {
                entries.push(Entry::from_ldif(&record)?);
            }
            record.clear();
        } else if !(record.is_empty() && line.starts_with("version:")) {
            record.push_str(line);
            record.push('\n');
        }
    }
    if !record.trim().is_empty() {
        entries.push(Entry::from_ldif(&record)?);
    }
    Ok(entries)
}

fn spawn_health_logger(
    monitor: Arc<HealthMonitor>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut previous = HealthStatus::Unknown;
        loop {
            ticker.tick().await;
            let report = monitor.check_health();
            if report.overall == previous {
                continue;
            }
            for component in &report.components {
                if component.status != HealthStatus::Healthy {
                    warn!("{} is {:?}", component.name, component.status);
                }
            }
            info!("Node health {:?} -> {:?}", previous, report.overall);
            previous = report.overall;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::backend::Dn;
    use dirsync_core::testing::{TestContext, relay_config, reserve_addrs};
    use dirsync_core::{Backend, ReplicationDomainConfig};
    use std::time::Duration;

    const LDIF: &str = "version: 1\n\
dn: dc=example,dc=com\n\
objectclass: domain\n\
\n\
# a person\n\
dn: cn=alice,dc=example,dc=com\n\
objectclass: person\n\
cn: alice\n\
sn: Liddell\n";

    #[test]
    fn test_parse_ldif_records() {
        let entries = parse_ldif(LDIF).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].first_str("sn"), Some("Liddell"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_node_runs_relay_and_seeded_domain() {
        let ctx = TestContext::new();
        let ldif = ctx.path().join("seed.ldif");
        std::fs::write(&ldif, LDIF).unwrap();

        let addr = reserve_addrs(1)[0];
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let config = NodeConfig {
            replication_server: Some(relay_config(&ctx, 1, addr, &[])),
            domains: vec![DomainNodeConfig {
                replication: ReplicationDomainConfig::new(base.clone(), 11, vec![addr.to_string()]),
                seed_ldif: Some(ldif),
            }],
            health_interval: Duration::from_secs(60),
        };

        let mut node = Node::start(config).await.unwrap();
        assert_eq!(node.servers().len(), 1);
        let domain = node.domains().get(&base).unwrap();
        assert_eq!(domain.backend().count_entries(&base).unwrap(), 2);
        domain.broker().wait_connected(Duration::from_secs(10)).await.unwrap();
        assert_eq!(node.health().components.len(), 2);

        node.shutdown();
        assert!(node.domains().is_empty());
        assert!(domain.is_stopped());
    }

    #[tokio::test]
    async fn test_failed_start_stops_started_parts() {
        let ctx = TestContext::new();
        let addr = reserve_addrs(1)[0];
        let config = NodeConfig {
            replication_server: Some(relay_config(&ctx, 1, addr, &[])),
            domains: vec![DomainNodeConfig {
                replication: ReplicationDomainConfig::new(
                    Dn::parse("dc=example,dc=com").unwrap(),
                    11,
                    vec![addr.to_string()],
                ),
                seed_ldif: Some(ctx.path().join("missing.ldif")),
            }],
            health_interval: Duration::from_secs(60),
        };
        let err = Node::start(config).await.err().unwrap();
        assert!(format!("{:#}", err).contains("missing.ldif"));
    }
}
