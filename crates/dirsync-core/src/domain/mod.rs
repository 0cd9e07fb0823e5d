//! Replication domain (directory server side)
//!
//! One [`ReplicationDomain`] exists per replicated base DN. It:
//! - Stamps local changes with CSNs and publishes them through its broker
//! - Replays changes received from the topology, gated by its ServerState,
//!   holding back those whose parent or target has not arrived yet
//! - Runs total updates (import and export) driven by administrative tasks
//! - Persists its ServerState and generation ID
//!
//! Incremental replay and total update never run at the same time: while an
//! import is in progress, incoming updates are dropped and local writes are
//! refused. The relay resends everything newer than the imported state once
//! the broker reconnects.

mod ie;
mod own_log;
mod pending;
mod state_store;

pub use ie::{TotalUpdateKind, TotalUpdateStatus};
pub use own_log::OwnChangeLog;
pub use state_store::{DomainStateStore, PersistedState};

use crate::backend::{Backend, Dn, OperationRequest, ResultCode};
use crate::broker::{BrokerStats, ReceiveOutcome, ReplicationBroker};
use crate::config::ReplicationDomainConfig;
use crate::csn::{Clock, Csn, CsnGenerator};
use crate::protocol::{ReplicationMessage, ServerStatus, TopologyMsg, UpdateMsg};
use crate::server_state::{ServerState, SharedServerState};
use crate::{Error, Result};
use ie::IeContext;
use pending::{PendingChanges, is_dependency_failure};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Domain counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DomainStats {
    /// Local changes applied and published
    pub local_updates: u64,
    /// Local changes refused by the backend or during an import
    pub local_failures: u64,
    /// Remote changes replayed
    pub replayed_updates: u64,
    /// Remote changes the backend failed to apply
    pub replay_failures: u64,
    /// Remote changes that had to wait for a change they depend on
    pub held_updates: u64,
    /// Remote changes already covered by the ServerState
    pub duplicate_updates: u64,
    /// Remote changes dropped because an import was running
    pub dropped_during_import: u64,
    /// Completed imports
    pub imports: u64,
    /// Completed exports
    pub exports: u64,
    /// Entries written by imports
    pub entries_imported: u64,
    /// Entries sent by exports
    pub entries_exported: u64,
}

/// Outcome of [`ReplicationDomain::process_local`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalOutcome {
    /// Result of the storage operation
    pub code: ResultCode,
    /// CSN of the published change, when it was applied
    pub csn: Option<Csn>,
}

/// Replication of one base DN on a directory server
pub struct ReplicationDomain {
    config: ReplicationDomainConfig,
    backend: Arc<dyn Backend>,
    generator: CsnGenerator,
    state: Arc<SharedServerState>,
    generation_id: AtomicI64,
    broker: ReplicationBroker,
    own_log: Arc<OwnChangeLog>,
    write_lock: tokio::sync::Mutex<()>,
    ie: Mutex<Option<IeContext>>,
    pending: Mutex<PendingChanges>,
    store: Option<DomainStateStore>,
    applied_since_save: AtomicU64,
    stats: Mutex<DomainStats>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl ReplicationDomain {
    /// Create a domain over `backend`; nothing connects until [`start`](Self::start)
    ///
    /// The ServerState and generation ID come from the state directory when
    /// one is configured and holds a saved state, otherwise the generation ID
    /// is computed from the current data.
    pub fn new(config: ReplicationDomainConfig, backend: Arc<dyn Backend>) -> Result<Arc<Self>> {
        let generator = CsnGenerator::new(config.server_id);
        Self::build(config, backend, generator)
    }

    /// Same as [`new`](Self::new) with an injected CSN clock
    pub fn with_clock(
        config: ReplicationDomainConfig,
        backend: Arc<dyn Backend>,
        clock: Clock,
    ) -> Result<Arc<Self>> {
        let generator = CsnGenerator::with_clock(config.server_id, clock);
        Self::build(config, backend, generator)
    }

    fn build(
        config: ReplicationDomainConfig,
        backend: Arc<dyn Backend>,
        generator: CsnGenerator,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let store = config
            .state_dir
            .as_ref()
            .map(|dir| DomainStateStore::new(dir, &config.base_dn));
        let persisted = match &store {
            Some(store) => store.load()?,
            None => None,
        };

        let (server_state, generation_id) = match persisted {
            Some(saved) => {
                if saved.base_dn != config.base_dn {
                    return Err(Error::config(format!(
                        "State file {} belongs to {}",
                        store.as_ref().map(|s| s.path().display().to_string()).unwrap_or_default(),
                        saved.base_dn
                    )));
                }
                if saved.inconsistent {
                    tracing::warn!(
                        "Domain {} was left inconsistent by an aborted import, re-initialize it",
                        config.base_dn
                    );
                    backend.set_inconsistent(true);
                }
                (saved.server_state, saved.generation_id)
            }
            None => {
                let state = ServerState::new();
                let entries = backend.count_entries(&config.base_dn)?;
                let generation_id = state.compute_generation_id(entries);
                (state, generation_id)
            }
        };

        if let Some(own) = server_state.max_csn(config.server_id) {
            generator.adjust(&own);
        }

        let state = Arc::new(SharedServerState::new(server_state));
        let broker = ReplicationBroker::new(config.clone(), state.clone(), generation_id);
        let own_log = Arc::new(OwnChangeLog::new(config.server_id, config.own_log_capacity));

        tracing::info!(
            "Replication domain {} on server {} created (generation ID {})",
            config.base_dn,
            config.server_id,
            generation_id
        );

        let pending_capacity = config.pending_capacity;
        Ok(Arc::new(Self {
            config,
            backend,
            generator,
            state,
            generation_id: AtomicI64::new(generation_id),
            broker,
            own_log,
            write_lock: tokio::sync::Mutex::new(()),
            ie: Mutex::new(None),
            pending: Mutex::new(PendingChanges::new(pending_capacity)),
            store,
            applied_since_save: AtomicU64::new(0),
            stats: Mutex::new(DomainStats::default()),
            listener: Mutex::new(None),
            stop: CancellationToken::new(),
        }))
    }

    /// Connect to the topology and start replaying
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        self.broker.set_resend_source(self.own_log.clone());
        self.broker.start()?;
        let domain = self.clone();
        let handle = tokio::spawn(async move {
            domain.listen().await;
        });
        *self.listener.lock() = Some(handle);
        Ok(())
    }

    /// Stop replication; a running total update ends with `StoppedByError`
    pub fn stop(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        tracing::info!(
            "Stopping replication domain {} on server {}",
            self.config.base_dn,
            self.config.server_id
        );
        self.stop.cancel();
        self.abandon_total_update("Replication domain stopped");
        self.broker.stop();
        if let Err(e) = self.save_state() {
            tracing::error!("Failed to save state of {}: {}", self.config.base_dn, e);
        }
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Replicated base DN
    pub fn base_dn(&self) -> &Dn {
        &self.config.base_dn
    }

    /// Own server id
    pub fn server_id(&self) -> i32 {
        self.config.server_id
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationDomainConfig {
        &self.config
    }

    /// Storage engine
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Broker
    pub fn broker(&self) -> &ReplicationBroker {
        &self.broker
    }

    /// Copy of the ServerState
    pub fn server_state(&self) -> ServerState {
        self.state.snapshot()
    }

    /// Generation ID of the local data set
    pub fn generation_id(&self) -> i64 {
        self.generation_id.load(Ordering::SeqCst)
    }

    /// Replication status as announced to the topology
    pub fn status(&self) -> ServerStatus {
        self.broker.status()
    }

    /// Whether a session with a replication server is up
    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Other directory servers of the domain
    pub fn connected_dss(&self) -> Vec<i32> {
        self.broker.connected_dss()
    }

    /// Last topology received
    pub fn topology(&self) -> TopologyMsg {
        self.broker.topology()
    }

    /// Counters
    pub fn stats(&self) -> DomainStats {
        self.stats.lock().clone()
    }

    /// Remote changes currently held for a missing dependency
    pub fn pending_updates(&self) -> usize {
        self.pending.lock().len()
    }

    /// Broker counters
    pub fn broker_stats(&self) -> BrokerStats {
        self.broker.stats()
    }

    /// Own published changes still kept for resend
    pub fn own_log(&self) -> &Arc<OwnChangeLog> {
        &self.own_log
    }

    /// Apply a local write and publish it
    ///
    /// CSN issuance, storage apply and publish happen under one lock, so this
    /// replica's changes leave in strictly increasing CSN order. A publish
    /// that times out is logged; the change stays in the own-change log and
    /// is resent after the next handshake.
    pub async fn process_local(&self, request: OperationRequest) -> Result<LocalOutcome> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        if !request.dn().is_descendant_of(&self.config.base_dn) {
            return Err(Error::NoMatchingDomain(request.dn().to_string()));
        }
        if self.ie_importing() || self.backend.is_inconsistent() {
            self.stats.lock().local_failures += 1;
            tracing::debug!(
                "Refusing local {} on {} while the domain is being initialized",
                request.kind(),
                request.dn()
            );
            return Ok(LocalOutcome {
                code: ResultCode::UnwillingToPerform,
                csn: None,
            });
        }

        let _guard = self.write_lock.lock().await;
        let csn = self.generator.new_csn();
        let code = self.backend.handle(&request);
        if !code.is_success() {
            self.stats.lock().local_failures += 1;
            return Ok(LocalOutcome { code, csn: None });
        }

        self.state.update(csn);
        let update = UpdateMsg {
            csn,
            operation: request,
        };
        self.own_log.push(update.clone());
        self.stats.lock().local_updates += 1;
        self.note_applied();

        if let Err(e) = self.broker.publish(ReplicationMessage::Update(update)).await {
            tracing::warn!(
                "Change {} of {} not published yet ({}), it will be resent on reconnect",
                csn,
                self.config.base_dn,
                e
            );
        }
        Ok(LocalOutcome {
            code,
            csn: Some(csn),
        })
    }

    /// Persist ServerState and generation ID now
    pub fn save_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(&PersistedState {
            base_dn: self.config.base_dn.clone(),
            generation_id: self.generation_id(),
            server_state: self.state.snapshot(),
            inconsistent: self.backend.is_inconsistent(),
        })?;
        self.applied_since_save.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn note_applied(&self) {
        if self.store.is_none() {
            return;
        }
        let applied = self.applied_since_save.fetch_add(1, Ordering::SeqCst) + 1;
        if applied >= self.config.state_save_interval {
            if let Err(e) = self.save_state() {
                tracing::error!("Failed to save state of {}: {}", self.config.base_dn, e);
            }
        }
    }

    async fn listen(self: Arc<Self>) {
        tracing::debug!(
            "Listener of {} on server {} started",
            self.config.base_dn,
            self.config.server_id
        );
        loop {
            match self.broker.receive(self.config.receive_timeout).await {
                ReceiveOutcome::Message(message) => self.handle_message(message).await,
                ReceiveOutcome::Timeout => {}
                ReceiveOutcome::Closed => break,
            }
            self.check_total_update_progress().await;
        }
        tracing::debug!(
            "Listener of {} on server {} exited",
            self.config.base_dn,
            self.config.server_id
        );
    }

    async fn handle_message(self: &Arc<Self>, message: ReplicationMessage) {
        match message {
            ReplicationMessage::Update(update) => self.replay(update).await,
            ReplicationMessage::InitializeRequest {
                sender,
                destination,
                init_window,
                ..
            } => {
                if destination.includes(self.config.server_id) {
                    self.on_initialize_request(sender, init_window).await;
                }
            }
            ReplicationMessage::InitializeTarget(msg) => self.on_initialize_target(msg).await,
            ReplicationMessage::Entry {
                sender, seq, ldif, ..
            } => self.on_entry(sender, seq, &ldif).await,
            ReplicationMessage::Done { sender, .. } => self.on_done(sender).await,
            ReplicationMessage::InitializeRcvAck {
                sender, num_ack, ..
            } => self.on_ack(sender, num_ack),
            ReplicationMessage::Error {
                sender,
                code,
                details,
                ..
            } => self.on_error(sender, code, details).await,
            other => {
                tracing::debug!(
                    "Domain {} ignoring {:?}",
                    self.config.base_dn,
                    other.message_type()
                );
            }
        }
    }

    async fn replay(&self, update: UpdateMsg) {
        if self.ie_importing() {
            self.stats.lock().dropped_during_import += 1;
            tracing::debug!("Dropping {} received during an import", update.csn);
        } else if self.state.update(update.csn) {
            self.generator.adjust(&update.csn);
            self.apply_remote(update);
            self.note_applied();
        } else {
            self.stats.lock().duplicate_updates += 1;
        }
        self.broker.update_window_after_replay().await;
    }

    /// Apply one remote change, or hold it until what it depends on is applied
    fn apply_remote(&self, update: UpdateMsg) {
        let mut pending = self.pending.lock();
        if pending.blocks(update.dn()) {
            self.hold(&mut pending, update);
            return;
        }
        let code = self.backend.handle(&update.operation);
        if code.is_success() {
            self.stats.lock().replayed_updates += 1;
            if !pending.is_empty() {
                self.retry_pending(&mut pending);
            }
        } else if is_dependency_failure(code) {
            self.hold(&mut pending, update);
        } else {
            self.note_replay_failure(&update, code);
        }
    }

    fn hold(&self, pending: &mut PendingChanges, update: UpdateMsg) {
        tracing::debug!(
            "Holding {} {} on {} until the change it depends on is applied",
            update.csn,
            update.operation.kind(),
            update.dn()
        );
        self.stats.lock().held_updates += 1;
        if let Some(evicted) = pending.hold(update) {
            self.give_up(evicted);
        }
    }

    /// Retry held changes until a pass applies none
    fn retry_pending(&self, pending: &mut PendingChanges) {
        loop {
            let mut progress = false;
            for csn in pending.ready() {
                let Some(update) = pending.take(&csn) else {
                    continue;
                };
                let code = self.backend.handle(&update.operation);
                if code.is_success() {
                    self.stats.lock().replayed_updates += 1;
                    progress = true;
                } else if is_dependency_failure(code) {
                    if let Some(evicted) = pending.hold(update) {
                        self.give_up(evicted);
                    }
                } else {
                    self.note_replay_failure(&update, code);
                    progress = true;
                }
            }
            if !progress || pending.is_empty() {
                break;
            }
        }
    }

    /// Last attempt for a change evicted from the pending queue
    fn give_up(&self, update: UpdateMsg) {
        let code = self.backend.handle(&update.operation);
        if code.is_success() {
            self.stats.lock().replayed_updates += 1;
        } else {
            self.note_replay_failure(&update, code);
        }
    }

    fn note_replay_failure(&self, update: &UpdateMsg, code: ResultCode) {
        self.stats.lock().replay_failures += 1;
        tracing::warn!(
            "Replay of {} {} on {} returned {:?}",
            update.csn,
            update.operation.kind(),
            update.dn(),
            code
        );
    }
}

impl std::fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("base_dn", &self.config.base_dn)
            .field("server_id", &self.config.server_id)
            .field("generation_id", &self.generation_id())
            .field("status", &self.status())
            .finish()
    }
}
