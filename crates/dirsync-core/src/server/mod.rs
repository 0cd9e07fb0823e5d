//! Replication server (relay)
//!
//! The relay:
//! - Accepts sessions from directory servers and peer relays
//! - Opens one [`ReplicationServerDomain`] per base DN on first contact
//! - Persists every accepted update in that domain's changelog
//! - Connects to its configured peers for every domain it holds
//! - Purges changelog records older than the purge delay

mod domain;
mod handler;

pub use domain::{RelayDomainStats, ReplicationServerDomain, UNKNOWN_GENERATION_ID};
pub use handler::HandlerSnapshot;

use crate::backend::{Dn, ResultCode};
use crate::config::{MAX_SERVER_ID, ReplicationServerConfig};
use crate::protocol::{
    PROTOCOL_VERSION, ReplicationMessage, ServerTarget, StartMsg, negotiate_version,
};
use crate::session::Session;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReplicationServerStats {
    /// TCP connections accepted
    pub connections_accepted: u64,
    /// Handshakes that failed or were refused
    pub handshakes_refused: u64,
}

/// A running replication server
pub struct ReplicationServer {
    config: Arc<ReplicationServerConfig>,
    local_addr: SocketAddr,
    domains: DashMap<String, Arc<ReplicationServerDomain>>,
    create_lock: Mutex<()>,
    stats: Mutex<ReplicationServerStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    removed: AtomicBool,
    stop: CancellationToken,
}

impl ReplicationServer {
    /// Bind the listener, reopen domains found in the DB directory and start serving
    pub async fn start(config: ReplicationServerConfig) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;
        std::fs::create_dir_all(&config.db_dir)?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            config: Arc::new(config),
            local_addr,
            domains: DashMap::new(),
            create_lock: Mutex::new(()),
            stats: Mutex::new(ReplicationServerStats::default()),
            tasks: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            stop: CancellationToken::new(),
        });
        server.reopen_domains()?;

        let accept = tokio::spawn(server.clone().accept_loop(listener));
        let purge = tokio::spawn(server.clone().purge_loop());
        server.tasks.lock().extend([accept, purge]);

        tracing::info!(
            "Replication server {} listening on {} ({:?} changelog in {})",
            server.config.server_id,
            local_addr,
            server.config.changelog_backend,
            server.config.db_dir.display()
        );
        Ok(server)
    }

    /// Own server id
    pub fn server_id(&self) -> i32 {
        self.config.server_id
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationServerConfig {
        &self.config
    }

    /// Domain of `base_dn`; `None` when unknown or after [`remove`](Self::remove)
    pub fn domain(&self, base_dn: &Dn) -> Option<Arc<ReplicationServerDomain>> {
        self.domains
            .get(base_dn.normalized())
            .map(|domain| domain.clone())
    }

    /// Every domain, sorted by base DN
    pub fn domains(&self) -> Vec<Arc<ReplicationServerDomain>> {
        let mut domains: Vec<_> = self.domains.iter().map(|d| d.value().clone()).collect();
        domains.sort_by(|a, b| a.base_dn().cmp(b.base_dn()));
        domains
    }

    /// Counters
    pub fn stats(&self) -> ReplicationServerStats {
        self.stats.lock().clone()
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop listening and close every session
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        tracing::info!("Stopping replication server {}", self.config.server_id);
        self.stop.cancel();
        for domain in self.domains() {
            domain.shutdown();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Stop, release every changelog and delete the DB directory
    pub fn remove(&self) -> Result<()> {
        self.stop();
        self.removed.store(true, Ordering::SeqCst);
        let domains = self.domains();
        self.domains.clear();
        for domain in domains {
            domain.remove()?;
        }
        match std::fs::remove_dir_all(&self.config.db_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            "Removed replication server {} and {}",
            self.config.server_id,
            self.config.db_dir.display()
        );
        Ok(())
    }

    fn reopen_domains(self: &Arc<Self>) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.db_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(meta) = domain::read_meta(&path)? {
                self.get_or_open_domain(&meta.base_dn)?;
            }
        }
        Ok(())
    }

    fn get_or_open_domain(self: &Arc<Self>, base_dn: &Dn) -> Result<Arc<ReplicationServerDomain>> {
        if self.removed.load(Ordering::SeqCst) || self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        if let Some(domain) = self.domain(base_dn) {
            return Ok(domain);
        }
        let _guard = self.create_lock.lock();
        if let Some(domain) = self.domain(base_dn) {
            return Ok(domain);
        }
        let domain = ReplicationServerDomain::open(
            base_dn.clone(),
            self.config.clone(),
            self.stop.child_token(),
        )?;
        self.domains
            .insert(base_dn.normalized().to_string(), domain.clone());
        let connector = tokio::spawn(domain.clone().run_peer_connector(self.local_addr));
        self.tasks.lock().push(connector);
        Ok(domain)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.stats.lock().connections_accepted += 1;
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                tracing::debug!("Session from {} refused: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
        tracing::debug!("Accept loop of relay {} exited", self.config.server_id);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let session = Arc::new(Session::from_tcp(stream, self.stop.child_token())?);
        let handshake = tokio::time::timeout(self.config.connect_timeout, self.handshake(&session));
        let result = match handshake.await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("Handshake timed out")),
        };
        if result.is_err() {
            self.stats.lock().handshakes_refused += 1;
            session.close();
        }
        result
    }

    async fn handshake(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        let remote = match session.recv().await? {
            ReplicationMessage::Start(remote) => remote,
            other => {
                return Err(Error::protocol(format!(
                    "Expected Start, got {:?}",
                    other.message_type()
                )));
            }
        };
        if let Err(e) = self.check_start(&remote) {
            tracing::warn!(
                "Relay {} refused server {} from {}: {}",
                self.config.server_id,
                remote.server_id,
                session.peer(),
                e
            );
            let refusal = ReplicationMessage::Error {
                sender: self.config.server_id,
                destination: ServerTarget::Server(remote.server_id),
                code: ResultCode::UnwillingToPerform.code(),
                details: e.to_string(),
            };
            let _ = session.send(&refusal).await;
            return Err(e);
        }
        let domain = self.get_or_open_domain(&remote.base_dn)?;
        domain.accept_session(session.clone(), remote).await
    }

    fn check_start(&self, remote: &StartMsg) -> Result<()> {
        if remote.server_id <= 0 || remote.server_id > MAX_SERVER_ID {
            return Err(Error::protocol(format!(
                "Server id {} out of range",
                remote.server_id
            )));
        }
        if remote.server_id == self.config.server_id {
            return Err(Error::protocol(format!(
                "Server id {} is the relay's own id",
                remote.server_id
            )));
        }
        negotiate_version(PROTOCOL_VERSION, remote.protocol_version)?;
        Ok(())
    }

    async fn purge_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.purge_interval) => {}
            }
            for domain in self.domains() {
                match domain.purge(self.config.purge_delay) {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(
                        "Purged {} changelog records of {} on relay {}",
                        purged,
                        domain.base_dn(),
                        self.config.server_id
                    ),
                    Err(e) => tracing::warn!(
                        "Changelog purge of {} failed: {}",
                        domain.base_dn(),
                        e
                    ),
                }
            }
        }
    }
}

impl std::fmt::Debug for ReplicationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationServer")
            .field("server_id", &self.config.server_id)
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
