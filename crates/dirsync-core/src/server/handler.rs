//! One relay session with a directory server or a peer relay
//!
//! Each handler runs a reader task and a writer task. Everything sent to the
//! peer goes through a bounded queue drained by the writer; only `Update`
//! frames wait for window credit. A full queue means the peer cannot keep
//! up: the session is dropped and the peer catches up from the changelog
//! when it comes back.

use super::domain::ReplicationServerDomain;
use crate::protocol::{DsInfo, ReplicationMessage, ServerKind, ServerStatus};
use crate::server_state::ServerState;
use crate::session::{CreditTracker, FlowWindow, Session, WINDOW_PROBE_INTERVAL};
use crate::Error;
use crate::csn::Csn;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Monitoring view of one relay session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerSnapshot {
    /// Peer server id
    pub server_id: i32,
    /// Directory server or relay
    pub kind: ServerKind,
    /// Remote address
    pub peer: String,
    /// Replication status of a directory server peer
    pub status: ServerStatus,
    /// Peer generation ID from its handshake
    pub generation_id: i64,
    /// Catch-up finished and live updates flow
    pub live: bool,
    /// Updates written to the peer
    pub updates_sent: u64,
    /// Updates read from the peer
    pub updates_received: u64,
    /// Messages waiting in the outbound queue
    pub queued: usize,
    /// Send credit left
    pub window_available: usize,
}

pub(crate) struct PeerHandler {
    pub(crate) id: u64,
    pub(crate) server_id: i32,
    pub(crate) kind: ServerKind,
    /// Server that opened the TCP connection
    pub(crate) initiator: i32,
    pub(crate) generation_id: i64,
    pub(crate) group_id: u8,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) session: Arc<Session>,
    outbound: mpsc::Sender<ReplicationMessage>,
    send_window: FlowWindow,
    credit: CreditTracker,
    sent: Mutex<ServerState>,
    status: Mutex<ServerStatus>,
    live: AtomicBool,
    remote_dss: RwLock<Vec<DsInfo>>,
    updates_sent: AtomicU64,
    updates_received: AtomicU64,
}

pub(crate) struct HandlerParams {
    pub id: u64,
    pub server_id: i32,
    pub kind: ServerKind,
    pub initiator: i32,
    pub generation_id: i64,
    pub group_id: u8,
    pub heartbeat_interval: Duration,
    pub peer_window: u32,
    pub own_window: u32,
    pub queue_capacity: usize,
    pub peer_state: ServerState,
    pub status: ServerStatus,
}

impl PeerHandler {
    pub(crate) fn new(
        session: Arc<Session>,
        params: HandlerParams,
    ) -> (Arc<Self>, mpsc::Receiver<ReplicationMessage>) {
        let (outbound, rx) = mpsc::channel(params.queue_capacity.max(1));
        let handler = Arc::new(Self {
            id: params.id,
            server_id: params.server_id,
            kind: params.kind,
            initiator: params.initiator,
            generation_id: params.generation_id,
            group_id: params.group_id,
            heartbeat_interval: params.heartbeat_interval,
            session,
            outbound,
            send_window: FlowWindow::new(params.peer_window),
            credit: CreditTracker::new(params.own_window),
            sent: Mutex::new(params.peer_state),
            status: Mutex::new(params.status),
            live: AtomicBool::new(false),
            remote_dss: RwLock::new(Vec::new()),
            updates_sent: AtomicU64::new(0),
            updates_received: AtomicU64::new(0),
        });
        (handler, rx)
    }

    pub(crate) fn is_directory(&self) -> bool {
        self.kind == ServerKind::Directory
    }

    pub(crate) fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ServerStatus) {
        *self.status.lock() = status;
    }

    /// Whether updates may flow to and from this peer
    pub(crate) fn accepts_updates(&self) -> bool {
        !self.is_directory() || self.status() != ServerStatus::BadGenerationId
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.session.is_closed()
    }

    pub(crate) fn set_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Record that the peer has `csn`; false when it already had it
    pub(crate) fn mark_sent(&self, csn: Csn) -> bool {
        self.sent.lock().update(csn)
    }

    pub(crate) fn sent_max(&self, replica_id: i32) -> Option<Csn> {
        self.sent.lock().max_csn(replica_id)
    }

    pub(crate) fn remote_dss(&self) -> Vec<DsInfo> {
        self.remote_dss.read().clone()
    }

    pub(crate) fn set_remote_dss(&self, dss: Vec<DsInfo>) {
        *self.remote_dss.write() = dss;
    }

    pub(crate) fn knows_ds(&self, server_id: i32) -> bool {
        self.remote_dss
            .read()
            .iter()
            .any(|ds| ds.server_id == server_id)
    }

    pub(crate) fn ds_info(&self, rs_id: i32) -> DsInfo {
        DsInfo {
            server_id: self.server_id,
            rs_id,
            generation_id: self.generation_id,
            status: self.status(),
            group_id: self.group_id,
        }
    }

    /// Queue a message without waiting; a full queue drops the session
    pub(crate) fn enqueue(&self, message: ReplicationMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue to server {} ({}) is full, dropping the session",
                    self.server_id,
                    self.session.peer()
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a message, waiting for room
    pub(crate) async fn enqueue_wait(&self, message: ReplicationMessage) -> crate::Result<()> {
        tokio::select! {
            _ = self.session.closed() => Err(Error::Stopped),
            sent = self.outbound.send(message) => sent.map_err(|_| Error::Stopped),
        }
    }

    pub(crate) fn close(&self) {
        self.send_window.close();
        self.session.close();
    }

    pub(crate) fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            server_id: self.server_id,
            kind: self.kind,
            peer: self.session.peer().to_string(),
            status: self.status(),
            generation_id: self.generation_id,
            live: self.is_live(),
            updates_sent: self.updates_sent.load(Ordering::Relaxed),
            updates_received: self.updates_received.load(Ordering::Relaxed),
            queued: self.outbound.max_capacity() - self.outbound.capacity(),
            window_available: self.send_window.available(),
        }
    }

    /// Drain the outbound queue into the session
    pub(crate) async fn run_writer(self: Arc<Self>, mut rx: mpsc::Receiver<ReplicationMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.session.closed() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if matches!(message, ReplicationMessage::Update(_)) {
                if self
                    .send_window
                    .acquire_or_probe(&self.session, WINDOW_PROBE_INTERVAL)
                    .await
                    .is_err()
                {
                    break;
                }
                self.updates_sent.fetch_add(1, Ordering::Relaxed);
            }
            if self.session.send(&message).await.is_err() {
                break;
            }
        }
        self.close();
    }

    /// Read from the peer until the session ends, then leave the domain
    pub(crate) async fn run_reader(self: Arc<Self>, domain: Arc<ReplicationServerDomain>) {
        loop {
            let message = match self.session.recv().await {
                Ok(message) => message,
                Err(Error::Codec(e)) => {
                    warn!("Dropping corrupt frame from {}: {}", self.session.peer(), e);
                    continue;
                }
                Err(e) => {
                    debug!("Session with server {} ended: {}", self.server_id, e);
                    break;
                }
            };
            match message {
                ReplicationMessage::Update(update) => {
                    self.updates_received.fetch_add(1, Ordering::Relaxed);
                    if self.accepts_updates() {
                        if let Err(e) = domain.accept_update(&self, update) {
                            warn!(
                                "Rejected update from server {} in {}: {}",
                                self.server_id,
                                domain.base_dn(),
                                e
                            );
                            if matches!(e, Error::ChangelogOrder { .. }) {
                                break;
                            }
                        }
                    } else {
                        domain.note_blocked_update(self.server_id);
                    }
                    if let Some(credits) = self.credit.processed() {
                        let grant = ReplicationMessage::Window { num_ack: credits };
                        if self.session.send(&grant).await.is_err() {
                            break;
                        }
                    }
                }
                ReplicationMessage::Window { num_ack } => self.send_window.release(num_ack),
                ReplicationMessage::WindowProbe => {
                    if let Some(credits) = self.credit.take() {
                        let grant = ReplicationMessage::Window { num_ack: credits };
                        if self.session.send(&grant).await.is_err() {
                            break;
                        }
                    }
                }
                ReplicationMessage::Heartbeat { .. } | ReplicationMessage::ServerState(_) => {}
                ReplicationMessage::ChangeStatus { status } => {
                    domain.on_status_change(&self, status);
                }
                ReplicationMessage::Topology(topology) => {
                    domain.on_peer_topology(&self, topology);
                }
                message @ (ReplicationMessage::InitializeRequest { .. }
                | ReplicationMessage::InitializeTarget(_)
                | ReplicationMessage::Entry { .. }
                | ReplicationMessage::InitializeRcvAck { .. }
                | ReplicationMessage::Done { .. }
                | ReplicationMessage::Error { .. }) => domain.route(&self, message),
                ReplicationMessage::Stop => {
                    debug!("Server {} closed its session", self.server_id);
                    break;
                }
                ReplicationMessage::Start(_) | ReplicationMessage::StartSession { .. } => {
                    warn!("Unexpected handshake message from {}", self.session.peer());
                }
            }
        }
        self.close();
        domain.unregister(&self);
    }
}

impl std::fmt::Debug for PeerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandler")
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .field("peer", &self.session.peer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn make_handler(kind: ServerKind, queue_capacity: usize) -> (Arc<PeerHandler>, mpsc::Receiver<ReplicationMessage>, Session) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let session = Arc::new(Session::new(Box::new(ar), Box::new(aw), "peer", CancellationToken::new()));
        let other = Session::new(Box::new(br), Box::new(bw), "relay", CancellationToken::new());
        let (handler, rx) = PeerHandler::new(
            session,
            HandlerParams {
                id: 1,
                server_id: 7,
                kind,
                initiator: 7,
                generation_id: 48,
                group_id: 1,
                heartbeat_interval: Duration::from_secs(1),
                peer_window: 2,
                own_window: 4,
                queue_capacity,
                peer_state: ServerState::new(),
                status: ServerStatus::Normal,
            },
        );
        (handler, rx, other)
    }

    #[tokio::test]
    async fn test_full_queue_drops_session() {
        let (handler, _rx, _other) = make_handler(ServerKind::Directory, 2);
        assert!(handler.enqueue(ReplicationMessage::WindowProbe));
        assert!(handler.enqueue(ReplicationMessage::WindowProbe));
        assert_eq!(handler.snapshot().queued, 2);
        assert!(!handler.enqueue(ReplicationMessage::WindowProbe));
        assert!(handler.is_closed());
    }

    #[tokio::test]
    async fn test_bad_generation_blocks_updates_of_directory_servers_only() {
        let (ds, _rx, _other) = make_handler(ServerKind::Directory, 4);
        assert!(ds.accepts_updates());
        ds.set_status(ServerStatus::BadGenerationId);
        assert!(!ds.accepts_updates());

        let (rs, _rx, _other) = make_handler(ServerKind::Replication, 4);
        rs.set_status(ServerStatus::BadGenerationId);
        assert!(rs.accepts_updates());
    }

    #[tokio::test]
    async fn test_mark_sent_dedupes() {
        let (handler, _rx, _other) = make_handler(ServerKind::Directory, 4);
        let csn = Csn::new(10, 0, 3);
        assert!(handler.mark_sent(csn));
        assert!(!handler.mark_sent(csn));
        assert_eq!(handler.sent_max(3), Some(csn));
    }

    #[tokio::test]
    async fn test_writer_holds_updates_without_credit() {
        use crate::backend::{Dn, OperationRequest};
        use crate::protocol::UpdateMsg;

        let (handler, rx, other) = make_handler(ServerKind::Directory, 8);
        let writer = tokio::spawn(handler.clone().run_writer(rx));
        for ts in 1..=3 {
            handler.enqueue(ReplicationMessage::Update(UpdateMsg {
                csn: Csn::new(ts, 0, 1),
                operation: OperationRequest::Delete {
                    dn: Dn::parse("cn=x,dc=example,dc=com").unwrap(),
                },
            }));
        }
        for _ in 0..2 {
            assert!(matches!(other.recv().await.unwrap(), ReplicationMessage::Update(_)));
        }
        // Window of 2 is exhausted; the third update waits and the writer probes
        let next = tokio::time::timeout(Duration::from_secs(2), other.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, ReplicationMessage::WindowProbe);
        assert_eq!(handler.snapshot().updates_sent, 2);

        handler.send_window.release(1);
        let third = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match other.recv().await.unwrap() {
                    ReplicationMessage::WindowProbe => continue,
                    message => return message,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(third, ReplicationMessage::Update(u) if u.csn.timestamp == 3));
        handler.close();
        writer.await.unwrap();
    }
}
