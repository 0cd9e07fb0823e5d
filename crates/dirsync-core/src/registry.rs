//! Explicit registries of running replication objects
//!
//! The process bootstrap owns one [`DomainRegistry`] and one
//! [`ReplicationServerRegistry`]; tasks and monitoring look objects up here.

use crate::backend::Dn;
use crate::domain::ReplicationDomain;
use crate::server::ReplicationServer;
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Replication domains by normalized base DN
#[derive(Default)]
pub struct DomainRegistry {
    domains: DashMap<String, Arc<ReplicationDomain>>,
}

impl DomainRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain; fails when its base DN is taken
    pub fn register(&self, domain: Arc<ReplicationDomain>) -> Result<()> {
        let key = domain.base_dn().normalized().to_string();
        match self.domains.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::config(format!(
                "A replication domain is already registered for {}",
                domain.base_dn()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(domain);
                Ok(())
            }
        }
    }

    /// Remove and return the domain of `base_dn`
    pub fn deregister(&self, base_dn: &Dn) -> Option<Arc<ReplicationDomain>> {
        self.domains.remove(base_dn.normalized()).map(|(_, d)| d)
    }

    /// Domain configured for exactly `base_dn`
    pub fn get(&self, base_dn: &Dn) -> Option<Arc<ReplicationDomain>> {
        self.domains.get(base_dn.normalized()).map(|d| d.clone())
    }

    /// All registered domains
    pub fn list(&self) -> Vec<Arc<ReplicationDomain>> {
        self.domains.iter().map(|d| d.value().clone()).collect()
    }

    /// Number of registered domains
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether no domain is registered
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Replication servers by server id
#[derive(Default)]
pub struct ReplicationServerRegistry {
    servers: DashMap<i32, Arc<ReplicationServer>>,
}

impl ReplicationServerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server; fails when its id is taken
    pub fn register(&self, server: Arc<ReplicationServer>) -> Result<()> {
        let id = server.server_id();
        match self.servers.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::config(format!(
                "Replication server {} is already registered",
                id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(server);
                Ok(())
            }
        }
    }

    /// Remove and return server `id`
    pub fn deregister(&self, id: i32) -> Option<Arc<ReplicationServer>> {
        self.servers.remove(&id).map(|(_, s)| s)
    }

    /// Server `id`
    pub fn get(&self, id: i32) -> Option<Arc<ReplicationServer>> {
        self.servers.get(&id).map(|s| s.clone())
    }

    /// All registered servers, by id
    pub fn list(&self) -> Vec<Arc<ReplicationServer>> {
        let mut servers: Vec<_> = self.servers.iter().map(|s| s.value().clone()).collect();
        servers.sort_by_key(|s| s.server_id());
        servers
    }

    /// Number of registered servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no server is registered
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
