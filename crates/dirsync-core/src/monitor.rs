//! Monitoring snapshots and health checks
//!
//! Snapshots are plain serializable values captured from a running
//! [`ReplicationDomain`] or [`ReplicationServer`]; they never hold locks.
//! [`HealthMonitor`] aggregates any number of [`HealthCheck`]s into one
//! overall status.

use crate::domain::{DomainStats, ReplicationDomain, TotalUpdateStatus};
use crate::protocol::ServerStatus;
use crate::server::{
    HandlerSnapshot, RelayDomainStats, ReplicationServer, ReplicationServerDomain,
    ReplicationServerStats,
};
use crate::server_state::ServerState;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monitoring view of a directory server domain
#[derive(Debug, Clone, Serialize)]
pub struct DomainMonitor {
    /// Replicated base DN
    pub base_dn: String,
    /// Own server id
    pub server_id: i32,
    /// Replication status
    pub status: ServerStatus,
    /// Generation ID of the local data
    pub generation_id: i64,
    /// Newest change applied per replica
    pub server_state: ServerState,
    /// Relay the broker is connected to
    pub connected_rs: Option<i32>,
    /// Directory servers of the current topology
    pub connected_dss: Vec<i32>,
    /// Domain counters
    pub stats: DomainStats,
    /// Remote changes waiting for a change they depend on
    pub pending_updates: usize,
    /// Sessions opened by the broker
    pub sessions: u64,
    /// Sessions lost or refused
    pub reconnects: u64,
    /// Why the last handshake failed
    pub last_handshake_error: Option<String>,
    /// Running import or export
    pub total_update: Option<TotalUpdateStatus>,
    /// Backend data left inconsistent by an aborted import
    pub inconsistent: bool,
    /// Whether the domain was stopped
    pub stopped: bool,
}

impl DomainMonitor {
    /// Snapshot `domain`
    pub fn capture(domain: &ReplicationDomain) -> Self {
        let broker = domain.broker_stats();
        Self {
            base_dn: domain.base_dn().to_string(),
            server_id: domain.server_id(),
            status: domain.status(),
            generation_id: domain.generation_id(),
            server_state: domain.server_state(),
            connected_rs: broker.connected_rs,
            connected_dss: domain.connected_dss(),
            stats: domain.stats(),
            pending_updates: domain.pending_updates(),
            sessions: broker.sessions,
            reconnects: broker.reconnects,
            last_handshake_error: broker.last_handshake_error,
            total_update: domain.total_update(),
            inconsistent: domain.backend().is_inconsistent(),
            stopped: domain.is_stopped(),
        }
    }
}

/// Monitoring view of one base DN on a relay
#[derive(Debug, Clone, Serialize)]
pub struct RelayDomainMonitor {
    /// Replicated base DN
    pub base_dn: String,
    /// Generation ID the relay holds, if any
    pub generation_id: Option<i64>,
    /// Newest change stored per replica
    pub server_state: ServerState,
    /// Directory servers of the topology, local and behind peer relays
    pub connected_dss: Vec<i32>,
    /// Directory servers attached to this relay
    pub local_dss: Vec<i32>,
    /// Peer relays connected
    pub connected_rss: Vec<i32>,
    /// One entry per session
    pub handlers: Vec<HandlerSnapshot>,
    /// Domain counters
    pub stats: RelayDomainStats,
}

impl RelayDomainMonitor {
    /// Snapshot `domain`
    pub fn capture(domain: &ReplicationServerDomain) -> Self {
        Self {
            base_dn: domain.base_dn().to_string(),
            generation_id: domain.generation_id(),
            server_state: domain.server_state(),
            connected_dss: domain.connected_dss(),
            local_dss: domain.local_dss(),
            connected_rss: domain.connected_rss(),
            handlers: domain.handlers(),
            stats: domain.stats(),
        }
    }
}

/// Monitoring view of a relay
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationServerMonitor {
    /// Relay server id
    pub server_id: i32,
    /// Bound listen address
    pub listen_addr: String,
    /// Whether the relay was stopped
    pub stopped: bool,
    /// Relay counters
    pub stats: ReplicationServerStats,
    /// One entry per base DN, sorted
    pub domains: Vec<RelayDomainMonitor>,
}

impl ReplicationServerMonitor {
    /// Snapshot `server` and all its domains
    pub fn capture(server: &ReplicationServer) -> Self {
        Self {
            server_id: server.server_id(),
            listen_addr: server.local_addr().to_string(),
            stopped: server.is_stopped(),
            stats: server.stats(),
            domains: server
                .domains()
                .iter()
                .map(|d| RelayDomainMonitor::capture(d))
                .collect(),
        }
    }
}

/// Health of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Replicating normally
    Healthy,
    /// Working but lagging, disconnected or being re-initialized
    Degraded,
    /// Stopped, inconsistent or blocked
    Unhealthy,
    /// Nothing checked yet
    Unknown,
}

/// One health probe
pub trait HealthCheck: Send + Sync {
    /// Current health of the component
    fn check(&self) -> HealthStatus;

    /// Component name
    fn name(&self) -> &str;
}

/// Health of a directory server domain
pub struct DomainHealthCheck {
    name: String,
    domain: Arc<ReplicationDomain>,
}

impl DomainHealthCheck {
    /// Check `domain`
    pub fn new(domain: Arc<ReplicationDomain>) -> Self {
        Self {
            name: format!("domain {} on server {}", domain.base_dn(), domain.server_id()),
            domain,
        }
    }
}

impl HealthCheck for DomainHealthCheck {
    fn check(&self) -> HealthStatus {
        if self.domain.is_stopped() || self.domain.backend().is_inconsistent() {
            return HealthStatus::Unhealthy;
        }
        match self.domain.status() {
            ServerStatus::Normal => HealthStatus::Healthy,
            ServerStatus::BadGenerationId => HealthStatus::Unhealthy,
            ServerStatus::NotConnected | ServerStatus::Degraded | ServerStatus::FullUpdate => {
                HealthStatus::Degraded
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Health of a relay
pub struct RelayHealthCheck {
    name: String,
    server: Arc<ReplicationServer>,
}

impl RelayHealthCheck {
    /// Check `server`
    pub fn new(server: Arc<ReplicationServer>) -> Self {
        Self {
            name: format!("replication server {}", server.server_id()),
            server,
        }
    }
}

impl HealthCheck for RelayHealthCheck {
    fn check(&self) -> HealthStatus {
        if self.server.is_stopped() {
            return HealthStatus::Unhealthy;
        }
        let own_addr = self.server.local_addr();
        let expected_peers = self
            .server
            .config()
            .peers
            .iter()
            .filter(|p| p.parse::<SocketAddr>().ok() != Some(own_addr))
            .count();
        let lagging = self
            .server
            .domains()
            .iter()
            .any(|d| d.connected_rss().len() < expected_peers);
        if lagging {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Result of one check in a [`HealthReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    /// Check name
    pub name: String,
    /// Its status
    pub status: HealthStatus,
}

/// Outcome of [`HealthMonitor::check_health`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Worst status across components
    pub overall: HealthStatus,
    /// Per-component results
    pub components: Vec<ComponentHealth>,
}

/// Aggregates health checks
pub struct HealthMonitor {
    status: RwLock<HealthStatus>,
    checks: RwLock<Vec<Box<dyn HealthCheck>>>,
    last_check: RwLock<Option<Instant>>,
    check_interval: Duration,
}

impl HealthMonitor {
    /// Monitor with no checks
    pub fn new(check_interval: Duration) -> Self {
        Self {
            status: RwLock::new(HealthStatus::Unknown),
            checks: RwLock::new(Vec::new()),
            last_check: RwLock::new(None),
            check_interval,
        }
    }

    /// Add a check
    pub fn add_check(&self, check: Box<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    /// Run every check. Unhealthy beats Degraded beats Unknown beats Healthy.
    pub fn check_health(&self) -> HealthReport {
        let checks = self.checks.read();
        let mut overall = HealthStatus::Healthy;
        let mut components = Vec::with_capacity(checks.len());
        for check in checks.iter() {
            let status = check.check();
            overall = match (overall, status) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                    HealthStatus::Unhealthy
                }
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
                (HealthStatus::Unknown, _) | (_, HealthStatus::Unknown) => HealthStatus::Unknown,
                _ => HealthStatus::Healthy,
            };
            components.push(ComponentHealth {
                name: check.name().to_string(),
                status,
            });
        }
        if overall != HealthStatus::Healthy {
            tracing::debug!("Health check: {:?}", overall);
        }
        *self.status.write() = overall;
        *self.last_check.write() = Some(Instant::now());
        HealthReport {
            overall,
            components,
        }
    }

    /// Status of the last run
    pub fn status(&self) -> HealthStatus {
        *self.status.read()
    }

    /// Whether the check interval elapsed since the last run
    pub fn is_due(&self) -> bool {
        match *self.last_check.read() {
            Some(at) => at.elapsed() >= self.check_interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Dn, MemoryBackend};
    use crate::config::ReplicationDomainConfig;

    struct Fixed(HealthStatus);

    impl HealthCheck for Fixed {
        fn check(&self) -> HealthStatus {
            self.0
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn domain(backend: Arc<MemoryBackend>) -> Arc<ReplicationDomain> {
        let config = ReplicationDomainConfig::new(
            Dn::parse("dc=example,dc=com").unwrap(),
            7,
            vec!["127.0.0.1:1".into()],
        );
        ReplicationDomain::new(config, backend).unwrap()
    }

    #[test]
    fn test_worst_status_wins() {
        let monitor = HealthMonitor::new(Duration::from_secs(30));
        assert_eq!(monitor.status(), HealthStatus::Unknown);
        assert!(monitor.is_due());

        monitor.add_check(Box::new(Fixed(HealthStatus::Healthy)));
        assert_eq!(monitor.check_health().overall, HealthStatus::Healthy);

        monitor.add_check(Box::new(Fixed(HealthStatus::Degraded)));
        assert_eq!(monitor.check_health().overall, HealthStatus::Degraded);

        monitor.add_check(Box::new(Fixed(HealthStatus::Unhealthy)));
        monitor.add_check(Box::new(Fixed(HealthStatus::Healthy)));
        let report = monitor.check_health();
        assert_eq!(report.overall, HealthStatus::Unhealthy);
        assert_eq!(report.components.len(), 4);
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        assert!(!monitor.is_due());
    }

    #[test]
    fn test_unconnected_domain_is_degraded() {
        let backend = Arc::new(MemoryBackend::new());
        let domain = domain(backend.clone());
        let check = DomainHealthCheck::new(domain.clone());
        assert_eq!(check.check(), HealthStatus::Degraded);
        assert!(check.name().contains("dc=example,dc=com"));

        backend.set_inconsistent(true);
        assert_eq!(check.check(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_domain_snapshot_serializes() {
        let domain = domain(Arc::new(MemoryBackend::new()));
        let snapshot = DomainMonitor::capture(&domain);
        assert_eq!(snapshot.server_id, 7);
        assert_eq!(snapshot.status, ServerStatus::NotConnected);
        assert!(snapshot.connected_rs.is_none());
        assert!(snapshot.total_update.is_none());
        assert!(!snapshot.inconsistent);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["server_id"], 7);
        assert_eq!(json["stats"]["local_updates"], 0);
    }

    #[tokio::test]
    async fn test_stopped_domain_is_unhealthy() {
        let domain = domain(Arc::new(MemoryBackend::new()));
        let check = DomainHealthCheck::new(domain.clone());
        domain.stop();
        assert_eq!(check.check(), HealthStatus::Unhealthy);
        assert!(DomainMonitor::capture(&domain).stopped);
    }
}
