//! Relays and directory server domains on loopback

use super::TestContext;
use crate::Result;
use crate::backend::{Backend, Dn, Entry, OperationRequest};
use crate::backoff::BackoffConfig;
use crate::config::{ReplicationDomainConfig, ReplicationServerConfig};
use crate::domain::ReplicationDomain;
use crate::server::ReplicationServer;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// `n` loopback addresses that were free a moment ago
///
/// Needed when relays must know each other's addresses before starting.
pub fn reserve_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("Failed to bind loopback port"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("Bound listener has an address"))
        .collect()
}

/// Relay configuration with quick reconnects and its changelog under `ctx`
pub fn relay_config(
    ctx: &TestContext,
    server_id: i32,
    listen_addr: SocketAddr,
    peers: &[SocketAddr],
) -> ReplicationServerConfig {
    ReplicationServerConfig::new(
        server_id,
        listen_addr,
        ctx.path().join(format!("relay-{}", server_id)),
    )
    .with_peers(peers.iter().map(|p| p.to_string()).collect())
    .with_backoff(BackoffConfig::quick())
}

/// Start a relay on an ephemeral port
pub async fn start_relay(
    ctx: &TestContext,
    server_id: i32,
    peers: &[SocketAddr],
) -> Result<Arc<ReplicationServer>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    ReplicationServer::start(relay_config(ctx, server_id, addr, peers)).await
}

/// Start a relay on a reserved address
pub async fn start_relay_at(
    ctx: &TestContext,
    server_id: i32,
    listen_addr: SocketAddr,
    peers: &[SocketAddr],
) -> Result<Arc<ReplicationServer>> {
    ReplicationServer::start(relay_config(ctx, server_id, listen_addr, peers)).await
}

/// Domain configuration with quick reconnects
pub fn domain_config(
    base_dn: &Dn,
    server_id: i32,
    relays: &[SocketAddr],
) -> ReplicationDomainConfig {
    ReplicationDomainConfig::new(
        base_dn.clone(),
        server_id,
        relays.iter().map(|r| r.to_string()).collect(),
    )
    .with_backoff(BackoffConfig::quick())
    .with_total_update_timeout(Duration::from_secs(20))
}

/// Create and start a domain
pub fn start_domain(
    config: ReplicationDomainConfig,
    backend: Arc<dyn Backend>,
) -> Result<Arc<ReplicationDomain>> {
    let domain = ReplicationDomain::new(config, backend)?;
    domain.start()?;
    Ok(domain)
}

/// Suffix entry for `base_dn`
pub fn base_entry(base_dn: &Dn) -> Entry {
    Entry::new(base_dn.clone()).with_attribute("objectclass", "domain")
}

/// Add of `cn=<cn>,<base_dn>` as a person
pub fn add_entry_request(base_dn: &Dn, cn: &str) -> Result<OperationRequest> {
    let dn = Dn::parse(&format!("cn={},{}", cn, base_dn))?;
    let entry = Entry::new(dn)
        .with_attribute("objectclass", "person")
        .with_attribute("cn", cn)
        .with_attribute("sn", cn);
    Ok(OperationRequest::Add { entry })
}
