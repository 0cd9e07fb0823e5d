//! Relay side of one replication domain
//!
//! A [`ReplicationServerDomain`] groups the sessions of every directory
//! server and peer relay sharing a base DN on this relay. It:
//! - Gates updates on its ServerState and appends them to the changelog
//! - Fans accepted updates out to live sessions
//! - Streams changelog records to newly connected peers before going live
//! - Routes total update messages by destination server id
//! - Pushes the topology whenever membership or status changes
//! - Keeps connecting to configured peer relays
//!
//! Relays form a full mesh: updates learned from a peer relay are forwarded
//! to local directory servers only.

use super::handler::{HandlerParams, HandlerSnapshot, PeerHandler};
use crate::backend::{Dn, ResultCode};
use crate::backoff::Backoff;
use crate::changelog::{ChangelogDb, MergedCursor, open_changelog};
use crate::config::ReplicationServerConfig;
use crate::csn::{Csn, current_time_ms};
use crate::protocol::{
    DsInfo, PROTOCOL_VERSION, ReplicationMessage, RsInfo, ServerKind, ServerStatus, ServerTarget,
    StartMsg, TopologyMsg, UpdateMsg, negotiate_version,
};
use crate::server_state::{EMPTY_BACKEND_GENERATION_ID, ServerState, SharedServerState};
use crate::session::{Session, initiate_handshake, spawn_heartbeat_monitor};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Generation ID a relay domain reports before it adopted one
pub const UNKNOWN_GENERATION_ID: i64 = -1;

const META_FILE: &str = "domain.json";
const PEER_CHECK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DomainMeta {
    pub base_dn: Dn,
    pub generation_id: Option<i64>,
}

pub(crate) fn read_meta(dir: &Path) -> Result<Option<DomainMeta>> {
    let path = dir.join(META_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::changelog(format!("Corrupt {}: {}", path.display(), e)))
}

fn write_meta(dir: &Path, meta: &DomainMeta) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| Error::internal(format!("Domain metadata serialization failed: {}", e)))?;
    let tmp = dir.join(format!("{}.tmp", META_FILE));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, dir.join(META_FILE))?;
    Ok(())
}

fn encode_update(update: &UpdateMsg) -> Result<Vec<u8>> {
    bincode::serialize(update).map_err(|e| Error::codec(format!("Update serialization failed: {}", e)))
}

fn decode_update(payload: &[u8]) -> Result<UpdateMsg> {
    bincode::deserialize(payload)
        .map_err(|e| Error::changelog(format!("Corrupt changelog record: {}", e)))
}

/// Relay domain counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayDomainStats {
    /// Updates appended to the changelog
    pub updates_accepted: u64,
    /// Updates already covered by the ServerState
    pub duplicates_discarded: u64,
    /// Updates dropped because their sender has a bad generation ID
    pub blocked_updates: u64,
    /// Update copies queued to live sessions
    pub updates_forwarded: u64,
    /// Changelog records streamed to peers before they went live
    pub catch_up_updates: u64,
    /// Total update messages delivered
    pub routed_messages: u64,
    /// Total update messages whose destination was not connected
    pub unroutable_messages: u64,
    /// Records removed by purges
    pub purged_records: u64,
}

/// Relay state of one base DN
pub struct ReplicationServerDomain {
    base_dn: Dn,
    server_id: i32,
    config: Arc<ReplicationServerConfig>,
    dir: PathBuf,
    changelog: Arc<dyn ChangelogDb>,
    state: SharedServerState,
    generation_id: Mutex<Option<i64>>,
    dss: RwLock<BTreeMap<i32, Arc<PeerHandler>>>,
    rss: RwLock<BTreeMap<i32, Arc<PeerHandler>>>,
    peer_ids: Mutex<HashMap<String, i32>>,
    publish_lock: Mutex<()>,
    next_handler_id: AtomicU64,
    stats: Mutex<RelayDomainStats>,
    stop: CancellationToken,
}

impl ReplicationServerDomain {
    /// Open (or create) the domain's changelog under the relay's DB directory
    pub(crate) fn open(
        base_dn: Dn,
        config: Arc<ReplicationServerConfig>,
        stop: CancellationToken,
    ) -> Result<Arc<Self>> {
        let dir = config.db_dir.join(base_dn.to_file_stem());
        std::fs::create_dir_all(&dir)?;
        let generation_id = match read_meta(&dir)? {
            Some(meta) if meta.base_dn != base_dn => {
                return Err(Error::config(format!(
                    "Changelog directory {} belongs to {}, not {}",
                    dir.display(),
                    meta.base_dn,
                    base_dn
                )));
            }
            Some(meta) => meta.generation_id,
            None => None,
        };
        let changelog = open_changelog(config.changelog_backend, &dir, config.lmdb_map_size)?;
        let state: ServerState = changelog
            .replica_ids()
            .into_iter()
            .filter_map(|replica_id| changelog.newest_csn(replica_id))
            .collect();

        write_meta(
            &dir,
            &DomainMeta {
                base_dn: base_dn.clone(),
                generation_id,
            },
        )?;
        info!(
            "Relay {} opened domain {} (generation ID {:?}, state {})",
            config.server_id, base_dn, generation_id, state
        );

        Ok(Arc::new(Self {
            server_id: config.server_id,
            base_dn,
            config,
            dir,
            changelog,
            state: SharedServerState::new(state),
            generation_id: Mutex::new(generation_id),
            dss: RwLock::new(BTreeMap::new()),
            rss: RwLock::new(BTreeMap::new()),
            peer_ids: Mutex::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            next_handler_id: AtomicU64::new(1),
            stats: Mutex::new(RelayDomainStats::default()),
            stop,
        }))
    }

    /// Replicated base DN
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Id of the relay holding this domain
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Generation ID adopted by this relay, if any
    pub fn generation_id(&self) -> Option<i64> {
        *self.generation_id.lock()
    }

    /// Newest changelog CSN per replica
    pub fn server_state(&self) -> ServerState {
        self.state.snapshot()
    }

    /// The changelog
    pub fn changelog(&self) -> Arc<dyn ChangelogDb> {
        self.changelog.clone()
    }

    /// Changelog directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory servers of the topology, attached here or to a peer relay
    pub fn connected_dss(&self) -> Vec<i32> {
        self.topology().dss.iter().map(|ds| ds.server_id).collect()
    }

    /// Directory servers attached to this relay
    pub fn local_dss(&self) -> Vec<i32> {
        self.dss
            .read()
            .values()
            .filter(|h| !h.is_closed())
            .map(|h| h.server_id)
            .collect()
    }

    /// Peer relays connected to this relay
    pub fn connected_rss(&self) -> Vec<i32> {
        self.rss
            .read()
            .values()
            .filter(|h| !h.is_closed())
            .map(|h| h.server_id)
            .collect()
    }

    /// Status of a locally connected directory server
    pub fn ds_status(&self, server_id: i32) -> Option<ServerStatus> {
        self.dss.read().get(&server_id).map(|h| h.status())
    }

    /// Topology as sent to directory servers
    pub fn topology(&self) -> TopologyMsg {
        let mut dss = self.local_ds_infos();
        let mut rss = vec![self.rs_info()];
        for relay in self.rss.read().values().filter(|h| !h.is_closed()) {
            rss.push(RsInfo {
                server_id: relay.server_id,
                generation_id: relay.generation_id,
                group_id: relay.group_id,
            });
            for ds in relay.remote_dss() {
                if !dss.iter().any(|known| known.server_id == ds.server_id) {
                    dss.push(ds);
                }
            }
        }
        dss.sort_by_key(|ds| ds.server_id);
        TopologyMsg { dss, rss }
    }

    /// Session monitoring views, directory servers first
    pub fn handlers(&self) -> Vec<HandlerSnapshot> {
        let mut views: Vec<HandlerSnapshot> =
            self.dss.read().values().map(|h| h.snapshot()).collect();
        views.extend(self.rss.read().values().map(|h| h.snapshot()));
        views
    }

    /// Counters
    pub fn stats(&self) -> RelayDomainStats {
        self.stats.lock().clone()
    }

    /// Drop changelog records older than `delay`
    pub fn purge(&self, delay: Duration) -> Result<u64> {
        let cutoff = current_time_ms().saturating_sub(delay.as_millis() as u64);
        if cutoff == 0 {
            return Ok(0);
        }
        let purged = self.changelog.purge_before(Csn::new(cutoff, 0, i32::MIN))?;
        self.stats.lock().purged_records += purged;
        Ok(purged)
    }

    fn rs_info(&self) -> RsInfo {
        RsInfo {
            server_id: self.server_id,
            generation_id: self.generation_id().unwrap_or(UNKNOWN_GENERATION_ID),
            group_id: self.config.group_id,
        }
    }

    fn local_ds_infos(&self) -> Vec<DsInfo> {
        self.dss
            .read()
            .values()
            .filter(|h| !h.is_closed())
            .map(|h| h.ds_info(self.server_id))
            .collect()
    }

    fn topology_for_relay(&self) -> TopologyMsg {
        TopologyMsg {
            dss: self.local_ds_infos(),
            rss: vec![self.rs_info()],
        }
    }

    fn start_msg(&self) -> StartMsg {
        StartMsg {
            kind: ServerKind::Replication,
            protocol_version: PROTOCOL_VERSION,
            base_dn: self.base_dn.clone(),
            server_id: self.server_id,
            generation_id: self.generation_id().unwrap_or(UNKNOWN_GENERATION_ID),
            group_id: self.config.group_id,
            window_size: self.config.window_size,
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
            server_state: self.state.snapshot(),
        }
    }

    fn save_meta(&self) {
        let meta = DomainMeta {
            base_dn: self.base_dn.clone(),
            generation_id: self.generation_id(),
        };
        if let Err(e) = write_meta(&self.dir, &meta) {
            warn!("Failed to save metadata of {}: {}", self.base_dn, e);
        }
    }

    /// Whether a directory server with `generation_id` may exchange updates
    fn admit_generation(&self, generation_id: i64) -> bool {
        let adopted = {
            let mut current = self.generation_id.lock();
            match *current {
                Some(ours) => return ours == generation_id,
                None if generation_id == EMPTY_BACKEND_GENERATION_ID => return true,
                None => {
                    *current = Some(generation_id);
                    generation_id
                }
            }
        };
        info!(
            "Relay {} adopted generation ID {} for {}",
            self.server_id, adopted, self.base_dn
        );
        self.save_meta();
        self.flag_bad_generations(adopted);
        true
    }

    fn adopt_relay_generation(&self, peer: i32, generation_id: i64) {
        if generation_id == UNKNOWN_GENERATION_ID || generation_id == EMPTY_BACKEND_GENERATION_ID {
            return;
        }
        let adopted = {
            let mut current = self.generation_id.lock();
            match *current {
                Some(ours) => {
                    if ours != generation_id {
                        warn!(
                            "Relay {} has generation ID {} for {}, relay {} has {}",
                            peer, generation_id, self.base_dn, self.server_id, ours
                        );
                    }
                    return;
                }
                None => {
                    *current = Some(generation_id);
                    generation_id
                }
            }
        };
        info!(
            "Relay {} adopted generation ID {} of relay {} for {}",
            self.server_id, adopted, peer, self.base_dn
        );
        self.save_meta();
        self.flag_bad_generations(adopted);
    }

    fn flag_bad_generations(&self, generation_id: i64) {
        for handler in self.dss.read().values() {
            if handler.generation_id != generation_id
                && handler.status() != ServerStatus::BadGenerationId
            {
                warn!(
                    "Directory server {} has generation ID {} instead of {} in {}",
                    handler.server_id, handler.generation_id, generation_id, self.base_dn
                );
                handler.set_status(ServerStatus::BadGenerationId);
            }
        }
    }

    fn new_handler(
        &self,
        session: Arc<Session>,
        remote: &StartMsg,
        group_id: u8,
        initiator: i32,
        status: ServerStatus,
    ) -> (Arc<PeerHandler>, mpsc::Receiver<ReplicationMessage>) {
        let peer_heartbeat = Duration::from_millis(remote.heartbeat_interval_ms);
        PeerHandler::new(
            session,
            HandlerParams {
                id: self.next_handler_id.fetch_add(1, Ordering::SeqCst),
                server_id: remote.server_id,
                kind: remote.kind,
                initiator,
                generation_id: remote.generation_id,
                group_id,
                heartbeat_interval: self.config.heartbeat_interval.max(peer_heartbeat),
                peer_window: remote.window_size,
                own_window: self.config.window_size,
                queue_capacity: self.config.queue_capacity,
                peer_state: remote.server_state.clone(),
                status,
            },
        )
    }

    /// Add a handler to the membership; false when it lost a duplicate check
    fn register(&self, handler: &Arc<PeerHandler>) -> bool {
        let map = if handler.is_directory() {
            &self.dss
        } else {
            &self.rss
        };
        let mut map = map.write();
        if let Some(existing) = map.get(&handler.server_id) {
            if !existing.is_closed() {
                if handler.is_directory() {
                    info!(
                        "Directory server {} reconnected to relay {}, replacing its old session",
                        handler.server_id, self.server_id
                    );
                } else {
                    // Both relays keep the connection opened by the lower id
                    let preferred = self.server_id.min(handler.server_id);
                    if existing.initiator == preferred || handler.initiator != preferred {
                        debug!(
                            "Relay {} already connected to relay {}, dropping duplicate",
                            self.server_id, handler.server_id
                        );
                        return false;
                    }
                }
                existing.close();
            }
        }
        map.insert(handler.server_id, handler.clone());
        true
    }

    pub(crate) fn unregister(&self, handler: &PeerHandler) {
        let map = if handler.is_directory() {
            &self.dss
        } else {
            &self.rss
        };
        let removed = {
            let mut map = map.write();
            if map
                .get(&handler.server_id)
                .is_some_and(|current| current.id == handler.id)
            {
                map.remove(&handler.server_id);
                true
            } else {
                false
            }
        };
        if removed {
            info!(
                "{} {} left {} on relay {}",
                kind_label(handler.kind),
                handler.server_id,
                self.base_dn,
                self.server_id
            );
            self.push_topology();
        }
    }

    fn activate(self: &Arc<Self>, handler: Arc<PeerHandler>, rx: mpsc::Receiver<ReplicationMessage>) {
        tokio::spawn(handler.clone().run_writer(rx));
        tokio::spawn(handler.clone().run_reader(self.clone()));
        spawn_heartbeat_monitor(handler.session.clone(), handler.heartbeat_interval);
        info!(
            "{} {} joined {} on relay {} ({})",
            kind_label(handler.kind),
            handler.server_id,
            self.base_dn,
            self.server_id,
            handler.status()
        );
        self.push_topology();
        let domain = self.clone();
        tokio::spawn(async move { domain.catch_up(handler).await });
    }

    /// Acceptor side of a handshake whose `Start` was already read
    pub(crate) async fn accept_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        remote: StartMsg,
    ) -> Result<()> {
        let version = negotiate_version(PROTOCOL_VERSION, remote.protocol_version)?;
        session
            .send(&ReplicationMessage::Start(self.start_msg()))
            .await?;
        session.set_version(version);

        let (requested, group_id) = loop {
            match session.recv().await? {
                ReplicationMessage::StartSession { status, group_id } => break (status, group_id),
                ReplicationMessage::Heartbeat { .. } => continue,
                other => {
                    return Err(Error::protocol(format!(
                        "Expected StartSession, got {:?}",
                        other.message_type()
                    )));
                }
            }
        };

        let status = match remote.kind {
            ServerKind::Directory => {
                if self.admit_generation(remote.generation_id) {
                    match requested {
                        ServerStatus::FullUpdate | ServerStatus::Degraded => requested,
                        _ => ServerStatus::Normal,
                    }
                } else {
                    warn!(
                        "Directory server {} connects to {} with generation ID {}, relay has {:?}",
                        remote.server_id,
                        self.base_dn,
                        remote.generation_id,
                        self.generation_id()
                    );
                    ServerStatus::BadGenerationId
                }
            }
            ServerKind::Replication => {
                self.adopt_relay_generation(remote.server_id, remote.generation_id);
                ServerStatus::Normal
            }
        };

        let (handler, rx) =
            self.new_handler(session.clone(), &remote, group_id, remote.server_id, status);
        if !self.register(&handler) {
            session.shutdown().await;
            return Ok(());
        }
        let topology = match remote.kind {
            ServerKind::Directory => self.topology(),
            ServerKind::Replication => self.topology_for_relay(),
        };
        if let Err(e) = session.send(&ReplicationMessage::Topology(topology)).await {
            handler.close();
            self.unregister(&handler);
            return Err(e);
        }
        self.activate(handler, rx);
        Ok(())
    }

    /// Stream changelog records the peer lacks, then mark it live
    async fn catch_up(self: Arc<Self>, handler: Arc<PeerHandler>) {
        if !handler.accepts_updates() {
            handler.set_live();
            return;
        }
        let threshold = (self.config.queue_capacity / 4).max(1) as u64;
        let mut total = 0u64;
        loop {
            match self.catch_up_pass(&handler).await {
                Ok(sent) => {
                    total += sent;
                    if sent < threshold {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Catch-up of server {} stopped: {}", handler.server_id, e);
                    handler.close();
                    return;
                }
            }
        }

        // Last records under the publish lock so none slips between catch-up and fan-out
        let last = {
            let _guard = self.publish_lock.lock();
            let result = self.final_catch_up_pass(&handler);
            if result.is_ok() {
                handler.set_live();
            }
            result
        };
        match last {
            Ok(sent) => total += sent,
            Err(e) => {
                debug!("Catch-up of server {} stopped: {}", handler.server_id, e);
                handler.close();
                return;
            }
        }
        self.stats.lock().catch_up_updates += total;
        if total > 0 {
            info!(
                "Relay {} sent {} changelog records of {} to server {}",
                self.server_id, total, self.base_dn, handler.server_id
            );
        }
    }

    /// Records the handler lacks, every replica merged in CSN order
    fn missing_records(&self, handler: &PeerHandler) -> Result<MergedCursor> {
        MergedCursor::open(self.changelog.as_ref(), |replica_id| {
            handler.sent_max(replica_id)
        })
    }

    async fn catch_up_pass(&self, handler: &PeerHandler) -> Result<u64> {
        let mut sent = 0u64;
        for record in self.missing_records(handler)? {
            let record = record?;
            if handler.mark_sent(record.csn) {
                let update = decode_update(&record.payload)?;
                handler
                    .enqueue_wait(ReplicationMessage::Update(update))
                    .await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    fn final_catch_up_pass(&self, handler: &PeerHandler) -> Result<u64> {
        let mut sent = 0u64;
        for record in self.missing_records(handler)? {
            let record = record?;
            if handler.mark_sent(record.csn) {
                let update = decode_update(&record.payload)?;
                if !handler.enqueue(ReplicationMessage::Update(update)) {
                    return Err(Error::connection("Outbound queue full during catch-up"));
                }
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Gate, persist and fan out one update
    pub(crate) fn accept_update(&self, origin: &PeerHandler, update: UpdateMsg) -> Result<()> {
        let csn = update.csn;
        let _guard = self.publish_lock.lock();
        origin.mark_sent(csn);
        if self.state.cover(&csn) {
            self.stats.lock().duplicates_discarded += 1;
            return Ok(());
        }
        let payload = encode_update(&update)?;
        self.changelog.append(csn.replica_id, csn, &payload)?;
        self.state.update(csn);

        let mut targets: Vec<Arc<PeerHandler>> = self.dss.read().values().cloned().collect();
        if origin.is_directory() {
            targets.extend(self.rss.read().values().cloned());
        }
        let mut forwarded = 0u64;
        for handler in targets {
            if handler.id == origin.id || !handler.is_live() || !handler.accepts_updates() {
                continue;
            }
            if handler.mark_sent(csn) && handler.enqueue(ReplicationMessage::Update(update.clone()))
            {
                forwarded += 1;
            }
        }
        let mut stats = self.stats.lock();
        stats.updates_accepted += 1;
        stats.updates_forwarded += forwarded;
        Ok(())
    }

    pub(crate) fn note_blocked_update(&self, server_id: i32) {
        debug!(
            "Dropping update from server {} with bad generation ID in {}",
            server_id, self.base_dn
        );
        self.stats.lock().blocked_updates += 1;
    }

    /// Deliver a total update message to its destination
    pub(crate) fn route(&self, origin: &PeerHandler, message: ReplicationMessage) {
        let Some((sender, destination)) = message.routing() else {
            return;
        };
        let from_relay = !origin.is_directory();
        match destination {
            ServerTarget::Server(target) => {
                let local = self.dss.read().get(&target).cloned();
                let next_hop = match local {
                    Some(ds) => Some(ds),
                    None if !from_relay => self
                        .rss
                        .read()
                        .values()
                        .find(|relay| relay.knows_ds(target))
                        .cloned(),
                    None => None,
                };
                match next_hop {
                    Some(handler) => {
                        if handler.enqueue(message) {
                            self.stats.lock().routed_messages += 1;
                        }
                    }
                    None => {
                        warn!(
                            "Relay {} cannot route {:?} from {} to unknown server {} in {}",
                            self.server_id,
                            message.message_type(),
                            sender,
                            target,
                            self.base_dn
                        );
                        self.stats.lock().unroutable_messages += 1;
                        if !matches!(message, ReplicationMessage::Error { .. }) {
                            origin.enqueue(ReplicationMessage::Error {
                                sender: target,
                                destination: ServerTarget::Server(sender),
                                code: ResultCode::UnwillingToPerform.code(),
                                details: format!(
                                    "Server {} is not connected to domain {}",
                                    target, self.base_dn
                                ),
                            });
                        }
                    }
                }
            }
            ServerTarget::All => {
                let mut targets: Vec<Arc<PeerHandler>> = self
                    .dss
                    .read()
                    .values()
                    .filter(|ds| ds.server_id != sender)
                    .cloned()
                    .collect();
                if !from_relay {
                    targets.extend(self.rss.read().values().cloned());
                }
                let mut delivered = 0u64;
                for handler in targets {
                    if handler.enqueue(message.clone()) {
                        delivered += 1;
                    }
                }
                self.stats.lock().routed_messages += delivered;
            }
        }
    }

    pub(crate) fn on_status_change(&self, handler: &PeerHandler, status: ServerStatus) {
        if !handler.is_directory() {
            return;
        }
        if handler.status() == ServerStatus::BadGenerationId {
            debug!(
                "Ignoring status {} of server {} with bad generation ID",
                status, handler.server_id
            );
            return;
        }
        if matches!(
            status,
            ServerStatus::NotConnected | ServerStatus::BadGenerationId
        ) {
            return;
        }
        if handler.status() != status {
            debug!("Server {} is now {} in {}", handler.server_id, status, self.base_dn);
            handler.set_status(status);
            self.push_topology();
        }
    }

    pub(crate) fn on_peer_topology(&self, handler: &PeerHandler, topology: TopologyMsg) {
        if handler.is_directory() {
            warn!("Ignoring topology sent by directory server {}", handler.server_id);
            return;
        }
        let dss = topology
            .dss
            .into_iter()
            .filter(|ds| ds.rs_id == handler.server_id)
            .collect();
        handler.set_remote_dss(dss);
        self.push_topology_to_dss();
    }

    fn push_topology(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.push_topology_to_dss();
        let for_relays = ReplicationMessage::Topology(self.topology_for_relay());
        let relays: Vec<Arc<PeerHandler>> = self.rss.read().values().cloned().collect();
        for relay in relays {
            relay.enqueue(for_relays.clone());
        }
    }

    fn push_topology_to_dss(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        let message = ReplicationMessage::Topology(self.topology());
        let dss: Vec<Arc<PeerHandler>> = self.dss.read().values().cloned().collect();
        for ds in dss {
            ds.enqueue(message.clone());
        }
    }

    fn peer_connected(&self, address: &str) -> bool {
        let known = self.peer_ids.lock().get(address).copied();
        match known {
            Some(id) if id == self.server_id => true,
            Some(id) => self.rss.read().get(&id).is_some_and(|h| !h.is_closed()),
            None => false,
        }
    }

    /// Keep a session open to every configured peer relay
    pub(crate) async fn run_peer_connector(self: Arc<Self>, own_addr: SocketAddr) {
        let peers: Vec<String> = self
            .config
            .peers
            .iter()
            .filter(|peer| peer.parse::<SocketAddr>().ok() != Some(own_addr))
            .cloned()
            .collect();
        if peers.is_empty() {
            return;
        }
        let mut schedule: HashMap<String, (Backoff, Instant)> = HashMap::new();
        loop {
            for address in &peers {
                if self.stop.is_cancelled() {
                    return;
                }
                if self.peer_connected(address) {
                    continue;
                }
                let (backoff, next_attempt) = schedule.entry(address.clone()).or_insert_with(|| {
                    (Backoff::new(self.config.backoff.clone()), Instant::now())
                });
                if Instant::now() < *next_attempt {
                    continue;
                }
                match self.connect_peer(address).await {
                    Ok(()) => backoff.reset(),
                    Err(Error::Stopped) => return,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        if backoff.attempts() == 1 {
                            warn!(
                                "Relay {} could not reach peer {} for {}: {}. Retrying in {:?}",
                                self.server_id, address, self.base_dn, e, delay
                            );
                        } else {
                            debug!(
                                "Relay {} still cannot reach peer {}: {}",
                                self.server_id, address, e
                            );
                        }
                        *next_attempt = Instant::now() + delay;
                    }
                }
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(PEER_CHECK_INTERVAL) => {}
            }
        }
    }

    async fn connect_peer(self: &Arc<Self>, address: &str) -> Result<()> {
        let session_cancel = self.stop.child_token();
        let handshake = async {
            let stream = TcpStream::connect(address).await?;
            let session = Arc::new(Session::from_tcp(stream, session_cancel.clone())?);
            let outcome = initiate_handshake(&session, self.start_msg(), ServerStatus::Normal).await?;
            Ok::<_, Error>((session, outcome))
        };
        let (session, outcome) = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            result = tokio::time::timeout(self.config.connect_timeout, handshake) => match result {
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

        let remote = outcome.remote;
        if remote.kind != ServerKind::Replication {
            session.close();
            return Err(Error::protocol(format!(
                "{} is not a replication server",
                address
            )));
        }
        self.peer_ids
            .lock()
            .insert(address.to_string(), remote.server_id);
        if remote.server_id == self.server_id {
            session.close();
            return Ok(());
        }
        self.adopt_relay_generation(remote.server_id, remote.generation_id);

        let (handler, rx) = self.new_handler(
            session.clone(),
            &remote,
            remote.group_id,
            self.server_id,
            ServerStatus::Normal,
        );
        handler.set_remote_dss(
            outcome
                .topology
                .dss
                .into_iter()
                .filter(|ds| ds.rs_id == remote.server_id)
                .collect(),
        );
        if !self.register(&handler) {
            session.shutdown().await;
            return Ok(());
        }
        self.activate(handler, rx);
        Ok(())
    }

    /// Close every session and persist metadata
    pub(crate) fn shutdown(&self) {
        self.stop.cancel();
        let handlers: Vec<Arc<PeerHandler>> = self
            .dss
            .read()
            .values()
            .chain(self.rss.read().values())
            .cloned()
            .collect();
        for handler in handlers {
            handler.close();
        }
        self.dss.write().clear();
        self.rss.write().clear();
        self.save_meta();
    }

    /// Shut down and delete the changelog with its directory
    pub(crate) fn remove(&self) -> Result<()> {
        self.shutdown();
        self.changelog.remove()
    }
}

impl std::fmt::Debug for ReplicationServerDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationServerDomain")
            .field("base_dn", &self.base_dn)
            .field("server_id", &self.server_id)
            .field("generation_id", &self.generation_id())
            .finish()
    }
}

fn kind_label(kind: ServerKind) -> &'static str {
    match kind {
        ServerKind::Directory => "Directory server",
        ServerKind::Replication => "Relay",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OperationRequest;
    use crate::config::ChangelogBackendKind;

    fn config(dir: &Path) -> Arc<ReplicationServerConfig> {
        Arc::new(
            ReplicationServerConfig::new(1, "127.0.0.1:0".parse().unwrap(), dir)
                .with_changelog_backend(ChangelogBackendKind::File),
        )
    }

    fn base_dn() -> Dn {
        Dn::parse("dc=example,dc=com").unwrap()
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_meta(dir.path()).unwrap().is_none());
        let meta = DomainMeta {
            base_dn: base_dn(),
            generation_id: Some(1234),
        };
        write_meta(dir.path(), &meta).unwrap();
        assert_eq!(read_meta(dir.path()).unwrap(), Some(meta));
    }

    #[test]
    fn test_update_payload_round_trip() {
        let update = UpdateMsg {
            csn: Csn::new(5, 1, 2),
            operation: OperationRequest::Delete {
                dn: Dn::parse("cn=a,dc=example,dc=com").unwrap(),
            },
        };
        let payload = encode_update(&update).unwrap();
        assert_eq!(decode_update(&payload).unwrap(), update);
        assert!(decode_update(&[0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_open_rebuilds_state_from_changelog() {
        let dir = tempfile::tempdir().unwrap();
        {
            let domain =
                ReplicationServerDomain::open(base_dn(), config(dir.path()), CancellationToken::new())
                    .unwrap();
            assert_eq!(domain.generation_id(), None);
            for ts in 1..=3 {
                let update = UpdateMsg {
                    csn: Csn::new(ts, 0, 4),
                    operation: OperationRequest::Delete {
                        dn: Dn::parse("cn=a,dc=example,dc=com").unwrap(),
                    },
                };
                domain
                    .changelog()
                    .append(4, update.csn, &encode_update(&update).unwrap())
                    .unwrap();
            }
            assert!(domain.admit_generation(777));
            assert!(!domain.admit_generation(778));
            domain.shutdown();
        }

        let domain =
            ReplicationServerDomain::open(base_dn(), config(dir.path()), CancellationToken::new())
                .unwrap();
        assert_eq!(domain.server_state().max_csn(4), Some(Csn::new(3, 0, 4)));
        assert_eq!(domain.generation_id(), Some(777));
    }

    #[tokio::test]
    async fn test_empty_backend_generation_is_not_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let domain =
            ReplicationServerDomain::open(base_dn(), config(dir.path()), CancellationToken::new())
                .unwrap();
        assert!(domain.admit_generation(EMPTY_BACKEND_GENERATION_ID));
        assert_eq!(domain.generation_id(), None);
        domain.adopt_relay_generation(2, UNKNOWN_GENERATION_ID);
        assert_eq!(domain.generation_id(), None);
        domain.adopt_relay_generation(2, 99);
        assert_eq!(domain.generation_id(), Some(99));
        assert!(!domain.admit_generation(EMPTY_BACKEND_GENERATION_ID));
    }

    #[tokio::test]
    async fn test_directory_claimed_by_other_domain_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let domain =
            ReplicationServerDomain::open(base_dn(), config.clone(), CancellationToken::new())
                .unwrap();
        write_meta(
            domain.dir(),
            &DomainMeta {
                base_dn: Dn::parse("dc=other").unwrap(),
                generation_id: None,
            },
        )
        .unwrap();
        drop(domain);
        assert!(ReplicationServerDomain::open(base_dn(), config, CancellationToken::new()).is_err());
    }
}
