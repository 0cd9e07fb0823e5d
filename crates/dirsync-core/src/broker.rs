//! Replication broker (directory server side)
//!
//! The broker owns the connection from a replication domain to one
//! replication server:
//! - Connects to any configured relay, rotating through the list
//! - Performs the `Start` / `StartSession` handshake
//! - Enforces the send window and grants receive credit
//! - Reconnects with backoff until stopped
//!
//! The domain talks to it through [`ReplicationBroker::publish`] and
//! [`ReplicationBroker::receive`].

use crate::backoff::Backoff;
use crate::config::ReplicationDomainConfig;
use crate::protocol::{
    DsInfo, PROTOCOL_VERSION, ReplicationMessage, ServerKind, ServerStatus, StartMsg,
    TopologyMsg, UpdateMsg,
};
use crate::server_state::{ServerState, SharedServerState};
use crate::session::{
    CreditTracker, FlowWindow, Session, WINDOW_PROBE_INTERVAL, initiate_handshake,
    spawn_heartbeat_monitor,
};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of [`ReplicationBroker::receive`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// A message for the domain
    Message(ReplicationMessage),
    /// Nothing arrived within the timeout
    Timeout,
    /// The broker was stopped
    Closed,
}

/// Source of own updates to resend after a handshake
pub trait ResendSource: Send + Sync {
    /// Own updates the relay has not seen, given its ServerState
    fn updates_after(&self, relay_state: &ServerState) -> Vec<UpdateMsg>;
}

/// Broker statistics
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Messages published
    pub messages_sent: u64,
    /// Messages delivered to the domain
    pub messages_received: u64,
    /// Sessions established
    pub sessions: u64,
    /// Sessions lost or refused
    pub reconnects: u64,
    /// Own updates resent after a handshake
    pub resent_updates: u64,
    /// Relay currently connected
    pub connected_rs: Option<i32>,
    /// Address of that relay
    pub connected_address: Option<String>,
    /// Relay generation ID from its `Start`
    pub rs_generation_id: Option<i64>,
    /// Relay ServerState from its `Start`
    pub rs_server_state: ServerState,
    /// Why the last handshake failed
    pub last_handshake_error: Option<String>,
}

/// One established session
struct Connection {
    id: u64,
    session: Arc<Session>,
    send_window: FlowWindow,
    credit: CreditTracker,
    rs_id: i32,
}

impl Connection {
    fn teardown(&self) {
        self.send_window.close();
        self.session.close();
    }
}

struct BrokerInner {
    config: ReplicationDomainConfig,
    state: Arc<SharedServerState>,
    generation_id: AtomicI64,
    status: Mutex<ServerStatus>,
    connection: watch::Sender<Option<Arc<Connection>>>,
    incoming_tx: mpsc::UnboundedSender<(u64, ReplicationMessage)>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, ReplicationMessage)>>,
    last_delivered: AtomicU64,
    next_connection_id: AtomicU64,
    topology: RwLock<TopologyMsg>,
    topology_version: watch::Sender<u64>,
    resend: RwLock<Option<Arc<dyn ResendSource>>>,
    stats: Mutex<BrokerStats>,
    running: AtomicBool,
    stop: CancellationToken,
}

/// Directory server side replication broker
#[derive(Clone)]
pub struct ReplicationBroker {
    inner: Arc<BrokerInner>,
}

impl ReplicationBroker {
    /// Create a broker; nothing connects until [`start`](Self::start)
    pub fn new(
        config: ReplicationDomainConfig,
        state: Arc<SharedServerState>,
        generation_id: i64,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (connection, _) = watch::channel(None);
        let (topology_version, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                state,
                generation_id: AtomicI64::new(generation_id),
                status: Mutex::new(ServerStatus::NotConnected),
                connection,
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                last_delivered: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
                topology: RwLock::new(TopologyMsg::default()),
                topology_version,
                resend: RwLock::new(None),
                stats: Mutex::new(BrokerStats::default()),
                running: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Own server id
    pub fn server_id(&self) -> i32 {
        self.inner.config.server_id
    }

    /// Register where own updates are resent from after each handshake
    pub fn set_resend_source(&self, source: Arc<dyn ResendSource>) {
        *self.inner.resend.write() = Some(source);
    }

    /// Start the connect loop
    pub fn start(&self) -> Result<()> {
        if self.inner.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("Broker already running"));
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            connect_loop(inner).await;
        });
        Ok(())
    }

    /// Stop for good: closes the session and unblocks every waiter
    pub fn stop(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        tracing::info!(
            "Stopping replication broker of server {} for {}",
            self.inner.config.server_id,
            self.inner.config.base_dn
        );
        self.inner.stop.cancel();
        if let Some(connection) = self.inner.connection.send_replace(None) {
            connection.teardown();
        }
        *self.inner.status.lock() = ServerStatus::NotConnected;
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Drop the current session; the connect loop re-handshakes at once
    pub fn restart(&self) {
        if let Some(connection) = self.inner.connection.borrow().clone() {
            tracing::info!(
                "Restarting session of server {} with replication server {}",
                self.inner.config.server_id,
                connection.rs_id
            );
            connection.teardown();
        }
    }

    /// Whether a session is established
    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .borrow()
            .as_ref()
            .is_some_and(|c| !c.session.is_closed())
    }

    /// Wait until a session is established
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.current_connection(deadline).await.map(|_| ())
    }

    /// Publish a message to the relay
    ///
    /// Waits for a session and, for updates, for window credit, at most the
    /// configured publish timeout. A lost session makes an update wait for
    /// the next one; the relay discards duplicates.
    pub async fn publish(&self, message: ReplicationMessage) -> Result<()> {
        let deadline = Instant::now() + self.inner.config.publish_timeout;
        let is_update = matches!(message, ReplicationMessage::Update(_));
        loop {
            let connection = self.current_connection(deadline).await?;
            if is_update {
                let acquired = tokio::select! {
                    biased;
                    _ = self.inner.stop.cancelled() => return Err(Error::Stopped),
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(Error::timeout("Publish window wait timed out"));
                    }
                    result = connection
                        .send_window
                        .acquire_or_probe(&connection.session, WINDOW_PROBE_INTERVAL) => result,
                };
                if acquired.is_err() {
                    continue;
                }
            }
            match connection.session.send(&message).await {
                Ok(()) => {
                    self.inner.stats.lock().messages_sent += 1;
                    return Ok(());
                }
                Err(_) if self.inner.stop.is_cancelled() => return Err(Error::Stopped),
                Err(e) if is_update => {
                    tracing::debug!("Publish failed ({}), waiting for a new session", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait up to `timeout` for the next message
    pub async fn receive(&self, timeout: Duration) -> ReceiveOutcome {
        if self.inner.stop.is_cancelled() {
            return ReceiveOutcome::Closed;
        }
        let mut rx = tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => return ReceiveOutcome::Closed,
            rx = self.inner.incoming_rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => ReceiveOutcome::Closed,
            item = rx.recv() => match item {
                Some((connection_id, message)) => {
                    self.inner.last_delivered.store(connection_id, Ordering::SeqCst);
                    self.inner.stats.lock().messages_received += 1;
                    ReceiveOutcome::Message(message)
                }
                None => ReceiveOutcome::Closed,
            },
            _ = tokio::time::sleep(timeout) => ReceiveOutcome::Timeout,
        }
    }

    /// Count one replayed update and grant credit when half a window is done
    pub async fn update_window_after_replay(&self) {
        let Some(connection) = self.inner.connection.borrow().clone() else {
            return;
        };
        if connection.id != self.inner.last_delivered.load(Ordering::SeqCst) {
            return;
        }
        if let Some(credits) = connection.credit.processed() {
            let grant = ReplicationMessage::Window { num_ack: credits };
            if let Err(e) = connection.session.send(&grant).await {
                tracing::debug!("Failed to grant window credit: {}", e);
            }
        }
    }

    /// Announce a status change to the topology
    pub async fn signal_status_change(&self, status: ServerStatus) -> Result<()> {
        *self.inner.status.lock() = status;
        let connection = self.inner.connection.borrow().clone();
        if let Some(connection) = connection {
            connection
                .session
                .send(&ReplicationMessage::ChangeStatus { status })
                .await?;
        }
        Ok(())
    }

    /// Current status of this server
    pub fn status(&self) -> ServerStatus {
        *self.inner.status.lock()
    }

    /// Generation ID sent in the next handshake
    pub fn generation_id(&self) -> i64 {
        self.inner.generation_id.load(Ordering::SeqCst)
    }

    /// Change the generation ID sent in the next handshake
    pub fn set_generation_id(&self, generation_id: i64) {
        self.inner.generation_id.store(generation_id, Ordering::SeqCst);
    }

    /// Last topology received
    pub fn topology(&self) -> TopologyMsg {
        self.inner.topology.read().clone()
    }

    /// Watch topology updates
    pub fn subscribe_topology(&self) -> watch::Receiver<u64> {
        self.inner.topology_version.subscribe()
    }

    /// Other directory servers of the domain, as last reported
    pub fn connected_dss(&self) -> Vec<i32> {
        let own = self.inner.config.server_id;
        let mut ids: Vec<i32> = self
            .inner
            .topology
            .read()
            .dss
            .iter()
            .map(|ds| ds.server_id)
            .filter(|id| *id != own)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Own entry in the last topology
    pub fn own_topology_info(&self) -> Option<DsInfo> {
        let own = self.inner.config.server_id;
        self.inner
            .topology
            .read()
            .dss
            .iter()
            .find(|ds| ds.server_id == own)
            .cloned()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BrokerStats {
        self.inner.stats.lock().clone()
    }

    async fn current_connection(&self, deadline: Instant) -> Result<Arc<Connection>> {
        let mut rx = self.inner.connection.subscribe();
        loop {
            if self.inner.stop.is_cancelled() {
                return Err(Error::Stopped);
            }
            if let Some(connection) = rx.borrow_and_update().clone() {
                if !connection.session.is_closed() {
                    return Ok(connection);
                }
            }
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => return Err(Error::Stopped),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Stopped);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::timeout("No replication server session"));
                }
            }
        }
    }
}

impl std::fmt::Debug for ReplicationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationBroker")
            .field("server_id", &self.inner.config.server_id)
            .field("base_dn", &self.inner.config.base_dn)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn connect_loop(inner: Arc<BrokerInner>) {
    let addresses = inner.config.replication_servers.clone();
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    let mut index = 0usize;
    if addresses.is_empty() {
        tracing::error!(
            "Server {} has no replication server configured for {}",
            inner.config.server_id,
            inner.config.base_dn
        );
        return;
    }

    while !inner.stop.is_cancelled() {
        let address = addresses[index % addresses.len()].clone();
        index = index.wrapping_add(1);

        match connect_once(&inner, &address).await {
            Ok(connection) => {
                backoff.reset();
                let session = connection.session.clone();
                tokio::select! {
                    _ = session.closed() => {}
                    _ = inner.stop.cancelled() => {}
                }
                connection.teardown();
                inner.connection.send_if_modified(|current| {
                    if current.as_ref().is_some_and(|c| c.id == connection.id) {
                        *current = None;
                        true
                    } else {
                        false
                    }
                });
                if inner.stop.is_cancelled() {
                    break;
                }
                tracing::warn!(
                    "Server {} lost session with replication server {} at {}",
                    inner.config.server_id,
                    connection.rs_id,
                    address
                );
                {
                    let mut stats = inner.stats.lock();
                    stats.reconnects += 1;
                    stats.connected_rs = None;
                    stats.connected_address = None;
                }
                set_disconnected_status(&inner);
                // Try the same relay first
                index = index.wrapping_sub(1);
            }
            Err(Error::Stopped) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Server {} could not connect to {}: {}. Retrying in {:?}",
                    inner.config.server_id,
                    address,
                    e,
                    delay
                );
                {
                    let mut stats = inner.stats.lock();
                    stats.reconnects += 1;
                    stats.last_handshake_error = Some(format!("{}: {}", address, e));
                }
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!("Connect loop of server {} exited", inner.config.server_id);
}

fn set_disconnected_status(inner: &BrokerInner) {
    let mut status = inner.status.lock();
    if *status != ServerStatus::FullUpdate {
        *status = ServerStatus::NotConnected;
    }
}

async fn connect_once(inner: &Arc<BrokerInner>, address: &str) -> Result<Arc<Connection>> {
    let config = &inner.config;
    let session_cancel = inner.stop.child_token();

    let handshake = async {
        let stream = TcpStream::connect(address).await?;
        let session = Arc::new(Session::from_tcp(stream, session_cancel.clone())?);
        let local = StartMsg {
            kind: ServerKind::Directory,
            protocol_version: PROTOCOL_VERSION,
            base_dn: config.base_dn.clone(),
            server_id: config.server_id,
            generation_id: inner.generation_id.load(Ordering::SeqCst),
            group_id: config.group_id,
            window_size: config.window_size,
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
            server_state: inner.state.snapshot(),
        };
        let requested = match *inner.status.lock() {
            ServerStatus::FullUpdate => ServerStatus::FullUpdate,
            _ => ServerStatus::Normal,
        };
        let outcome = initiate_handshake(&session, local, requested).await?;
        Ok::<_, Error>((session, outcome))
    };

    let (session, outcome) = tokio::select! {
        biased;
        _ = inner.stop.cancelled() => return Err(Error::Stopped),
        result = tokio::time::timeout(config.connect_timeout, handshake) => match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                session_cancel.cancel();
                return Err(e);
            }
            Err(_) => {
                session_cancel.cancel();
                return Err(Error::timeout(format!("Handshake with {} timed out", address)));
            }
        },
    };

    if outcome.remote.kind != ServerKind::Replication {
        session.close();
        return Err(Error::protocol(format!(
            "{} is not a replication server",
            address
        )));
    }

    let rs_id = outcome.remote.server_id;
    let connection = Arc::new(Connection {
        id: inner.next_connection_id.fetch_add(1, Ordering::SeqCst),
        session: session.clone(),
        send_window: FlowWindow::new(outcome.remote.window_size),
        credit: CreditTracker::new(config.window_size),
        rs_id,
    });

    store_topology(inner, outcome.topology);
    {
        let mut stats = inner.stats.lock();
        stats.sessions += 1;
        stats.connected_rs = Some(rs_id);
        stats.connected_address = Some(address.to_string());
        stats.rs_generation_id = Some(outcome.remote.generation_id);
        stats.rs_server_state = outcome.remote.server_state.clone();
        stats.last_handshake_error = None;
    }
    if outcome.remote.generation_id != inner.generation_id.load(Ordering::SeqCst) {
        tracing::warn!(
            "Server {} generation ID {} differs from replication server {} ({})",
            config.server_id,
            inner.generation_id.load(Ordering::SeqCst),
            rs_id,
            outcome.remote.generation_id
        );
    }

    let reader_inner = inner.clone();
    let reader_connection = connection.clone();
    tokio::spawn(async move {
        read_loop(reader_inner, reader_connection).await;
    });
    spawn_heartbeat_monitor(session.clone(), config.heartbeat_interval);

    resend_own_updates(inner, &connection, &outcome.remote.server_state).await?;

    {
        let mut status = inner.status.lock();
        if *status != ServerStatus::FullUpdate {
            *status = inner
                .topology
                .read()
                .dss
                .iter()
                .find(|ds| ds.server_id == config.server_id)
                .map(|ds| ds.status)
                .unwrap_or(ServerStatus::Normal);
        }
    }
    inner.connection.send_replace(Some(connection.clone()));
    tracing::info!(
        "Server {} connected to replication server {} at {} for {} (protocol v{})",
        config.server_id,
        rs_id,
        address,
        config.base_dn,
        outcome.version
    );
    Ok(connection)
}

async fn resend_own_updates(
    inner: &Arc<BrokerInner>,
    connection: &Arc<Connection>,
    relay_state: &ServerState,
) -> Result<()> {
    let source = inner.resend.read().clone();
    let Some(source) = source else {
        return Ok(());
    };
    let updates = source.updates_after(relay_state);
    if updates.is_empty() {
        return Ok(());
    }
    tracing::info!(
        "Server {} resending {} own updates to replication server {}",
        inner.config.server_id,
        updates.len(),
        connection.rs_id
    );
    let count = updates.len() as u64;
    for update in updates {
        connection
            .send_window
            .acquire_or_probe(&connection.session, WINDOW_PROBE_INTERVAL)
            .await?;
        connection
            .session
            .send(&ReplicationMessage::Update(update))
            .await?;
    }
    inner.stats.lock().resent_updates += count;
    Ok(())
}

fn store_topology(inner: &BrokerInner, topology: TopologyMsg) {
    *inner.topology.write() = topology;
    inner.topology_version.send_modify(|v| *v += 1);
}

async fn read_loop(inner: Arc<BrokerInner>, connection: Arc<Connection>) {
    let session = connection.session.clone();
    loop {
        let message = match session.recv().await {
            Ok(message) => message,
            Err(Error::Codec(e)) => {
                tracing::warn!("Dropping corrupt frame from {}: {}", session.peer(), e);
                continue;
            }
            Err(_) => break,
        };
        match message {
            ReplicationMessage::Window { num_ack } => connection.send_window.release(num_ack),
            ReplicationMessage::WindowProbe => {
                if let Some(credits) = connection.credit.take() {
                    let grant = ReplicationMessage::Window { num_ack: credits };
                    if session.send(&grant).await.is_err() {
                        break;
                    }
                }
            }
            ReplicationMessage::Heartbeat { .. } => {}
            ReplicationMessage::Topology(topology) => {
                if let Some(own) = topology
                    .dss
                    .iter()
                    .find(|ds| ds.server_id == inner.config.server_id)
                {
                    let mut status = inner.status.lock();
                    if *status != ServerStatus::FullUpdate {
                        *status = own.status;
                    }
                }
                store_topology(&inner, topology);
            }
            ReplicationMessage::ServerState(state) => {
                inner.stats.lock().rs_server_state = state;
            }
            ReplicationMessage::Stop => {
                tracing::info!("Replication server {} closed the session", connection.rs_id);
                break;
            }
            ReplicationMessage::Start(_) | ReplicationMessage::StartSession { .. } => {
                tracing::warn!("Unexpected handshake message from {}", session.peer());
            }
            ReplicationMessage::ChangeStatus { status } => {
                let mut current = inner.status.lock();
                if *current != ServerStatus::FullUpdate {
                    *current = status;
                }
            }
            other => {
                if inner.incoming_tx.send((connection.id, other)).is_err() {
                    break;
                }
            }
        }
    }
    connection.teardown();
}
