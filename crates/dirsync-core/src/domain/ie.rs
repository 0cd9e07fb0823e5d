//! Total update (import / export) state machine
//!
//! A domain holds at most one [`IeContext`]. Importing is driven by the
//! listener task as `InitializeTarget`, `Entry` and `Done` messages arrive;
//! exporting runs in its own task so acknowledgments keep flowing through
//! the listener while entries are streamed.

use super::ReplicationDomain;
use crate::backend::{Entry, ResultCode};
use crate::config::MAX_SERVER_ID;
use crate::protocol::{InitializeTargetMsg, ReplicationMessage, ServerStatus, ServerTarget};
use crate::server_state::ServerState;
use crate::task::TaskHandle;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Exporter re-checks acks, cancellation and topology at least this often
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Direction of a running total update
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalUpdateKind {
    /// This server receives the data
    Import,
    /// This server sends the data
    Export,
}

/// Monitoring view of a running total update
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TotalUpdateStatus {
    /// Direction
    pub kind: TotalUpdateKind,
    /// Source or target(s)
    pub peer: ServerTarget,
    /// Driving task
    pub task_id: Uuid,
    /// Entries transferred so far
    pub entries_done: u64,
    /// Entries still expected
    pub entries_left: u64,
}

pub(super) struct IeContext {
    direction: Direction,
    peer: ServerTarget,
    task: TaskHandle,
    previous_status: ServerStatus,
}

enum Direction {
    Import(ImportProgress),
    Export(Arc<ExportFeedback>),
}

struct ImportProgress {
    exporter: i32,
    started: bool,
    cleared: bool,
    expected: u64,
    received: u64,
    last_ack: u64,
    init_window: u32,
    generation_id: i64,
    server_state: ServerState,
    last_activity: Instant,
}

impl ImportProgress {
    fn new(exporter: i32) -> Self {
        Self {
            exporter,
            started: false,
            cleared: false,
            expected: 0,
            received: 0,
            last_ack: 0,
            init_window: 1,
            generation_id: 0,
            server_state: ServerState::new(),
            last_activity: Instant::now(),
        }
    }

    fn begin(&mut self, msg: &InitializeTargetMsg) {
        self.started = true;
        self.expected = msg.entry_count;
        self.init_window = msg.init_window.max(1);
        self.generation_id = msg.generation_id;
        self.server_state = msg.server_state.clone();
        self.last_activity = Instant::now();
    }

    fn ack_every(&self) -> u64 {
        u64::from((self.init_window / 2).max(1))
    }
}

#[derive(Default)]
struct ExportFeedback {
    acks: Mutex<HashMap<i32, u64>>,
    error: Mutex<Option<(i32, String)>>,
    notify: Notify,
}

impl ExportFeedback {
    fn min_ack(&self, targets: &[i32]) -> u64 {
        let acks = self.acks.lock();
        targets
            .iter()
            .map(|id| acks.get(id).copied().unwrap_or(0))
            .min()
            .unwrap_or(u64::MAX)
    }
}

enum TargetDecision {
    Start(TaskHandle),
    Busy,
}

fn status_after_total_update(previous: ServerStatus) -> ServerStatus {
    match previous {
        ServerStatus::BadGenerationId | ServerStatus::Degraded => previous,
        _ => ServerStatus::Normal,
    }
}

impl ReplicationDomain {
    /// Whether an import or export is in progress
    pub fn ie_running(&self) -> bool {
        self.ie.lock().is_some()
    }

    /// Running total update, if any
    pub fn total_update(&self) -> Option<TotalUpdateStatus> {
        let guard = self.ie.lock();
        let ctx = guard.as_ref()?;
        let progress = ctx.task.progress();
        Some(TotalUpdateStatus {
            kind: match ctx.direction {
                Direction::Import(_) => TotalUpdateKind::Import,
                Direction::Export(_) => TotalUpdateKind::Export,
            },
            peer: ctx.peer,
            task_id: ctx.task.id(),
            entries_done: progress.entries_done,
            entries_left: progress.entries_left,
        })
    }

    pub(super) fn ie_importing(&self) -> bool {
        matches!(
            self.ie.lock().as_ref(),
            Some(IeContext {
                direction: Direction::Import(_),
                ..
            })
        )
    }

    /// Import the whole domain from `source`
    ///
    /// Fails at once when the source is invalid or unreachable, or when a
    /// total update is already running. Otherwise asks the source to export
    /// and returns the task tracking the import.
    pub async fn initialize_from_remote(
        self: &Arc<Self>,
        source: ServerTarget,
    ) -> Result<TaskHandle> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        let own = self.config.server_id;
        let connected = self.broker.connected_dss();
        let source_id = match source {
            ServerTarget::Server(id) if id <= 0 || id == own || id > MAX_SERVER_ID => {
                return Err(Error::InvalidImportSource(id));
            }
            ServerTarget::Server(id) => {
                if !connected.contains(&id) {
                    return Err(Error::NoReachablePeer {
                        base_dn: self.config.base_dn.to_string(),
                        server_id: id,
                    });
                }
                id
            }
            ServerTarget::All => *connected
                .first()
                .ok_or_else(|| Error::NoRemotes(self.config.base_dn.to_string()))?,
        };

        let task = TaskHandle::new(self.config.base_dn.clone(), source);
        self.acquire_ie(IeContext {
            direction: Direction::Import(ImportProgress::new(source_id)),
            peer: ServerTarget::Server(source_id),
            task: task.clone(),
            previous_status: self.broker.status(),
        })?;
        task.log(format!(
            "Initializing {} from server {}",
            self.config.base_dn, source_id
        ));
        tracing::info!(
            "Server {} requesting total update of {} from server {}",
            own,
            self.config.base_dn,
            source_id
        );

        let request = ReplicationMessage::InitializeRequest {
            base_dn: self.config.base_dn.clone(),
            sender: own,
            destination: ServerTarget::Server(source_id),
            init_window: self.config.init_window,
        };
        if let Err(e) = self.broker.publish(request).await {
            self.release_ie(task.id());
            task.fail(e.result_code(), format!("Could not reach server {}: {}", source_id, e));
            return Err(e);
        }
        Ok(task)
    }

    /// Export the whole domain to `target`
    pub async fn initialize_remote(self: &Arc<Self>, target: ServerTarget) -> Result<TaskHandle> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        let own = self.config.server_id;
        let connected = self.broker.connected_dss();
        let targets = match target {
            ServerTarget::Server(id) => {
                if id == own || !connected.contains(&id) {
                    return Err(Error::NoReachablePeer {
                        base_dn: self.config.base_dn.to_string(),
                        server_id: id,
                    });
                }
                vec![id]
            }
            ServerTarget::All => {
                if connected.is_empty() {
                    return Err(Error::NoRemotes(self.config.base_dn.to_string()));
                }
                connected
            }
        };

        let task = TaskHandle::new(self.config.base_dn.clone(), target);
        let feedback = Arc::new(ExportFeedback::default());
        self.acquire_ie(IeContext {
            direction: Direction::Export(feedback.clone()),
            peer: target,
            task: task.clone(),
            previous_status: self.broker.status(),
        })?;
        task.log(format!(
            "Exporting {} to {}",
            self.config.base_dn, target
        ));

        let domain = self.clone();
        let init_window = self.config.init_window;
        let exporter = task.clone();
        tokio::spawn(async move {
            domain
                .run_export(targets, target, own, init_window, exporter, feedback)
                .await;
        });
        Ok(task)
    }

    fn acquire_ie(&self, ctx: IeContext) -> Result<()> {
        let mut slot = self.ie.lock();
        if slot.is_some() {
            return Err(Error::SimultaneousImportExport);
        }
        *slot = Some(ctx);
        Ok(())
    }

    fn release_ie(&self, task_id: Uuid) -> Option<IeContext> {
        let mut slot = self.ie.lock();
        if slot.as_ref().is_some_and(|ctx| ctx.task.id() == task_id) {
            slot.take()
        } else {
            None
        }
    }

    /// End any running total update at once (domain stop)
    pub(super) fn abandon_total_update(&self, reason: &str) {
        let Some(ctx) = self.ie.lock().take() else {
            return;
        };
        if let Direction::Import(progress) = &ctx.direction {
            if progress.cleared {
                self.backend.set_inconsistent(true);
            }
        }
        ctx.task.fail(ResultCode::Other, reason);
    }

    async fn send_error(&self, destination: ServerTarget, code: ResultCode, details: String) {
        let message = ReplicationMessage::Error {
            sender: self.config.server_id,
            destination,
            code: code.code(),
            details,
        };
        if let Err(e) = self.broker.publish(message).await {
            tracing::debug!("Could not report total update error to {}: {}", destination, e);
        }
    }

    pub(super) async fn on_initialize_request(self: &Arc<Self>, requester: i32, init_window: u32) {
        let task = TaskHandle::new(self.config.base_dn.clone(), ServerTarget::Server(requester));
        let feedback = Arc::new(ExportFeedback::default());
        let acquired = self.acquire_ie(IeContext {
            direction: Direction::Export(feedback.clone()),
            peer: ServerTarget::Server(requester),
            task: task.clone(),
            previous_status: self.broker.status(),
        });
        if let Err(e) = acquired {
            tracing::warn!(
                "Server {} refusing export of {} to server {}: {}",
                self.config.server_id,
                self.config.base_dn,
                requester,
                e
            );
            self.send_error(ServerTarget::Server(requester), e.result_code(), e.to_string())
                .await;
            return;
        }
        task.log(format!("Export requested by server {}", requester));

        let domain = self.clone();
        tokio::spawn(async move {
            domain
                .run_export(
                    vec![requester],
                    ServerTarget::Server(requester),
                    requester,
                    init_window.max(1),
                    task,
                    feedback,
                )
                .await;
        });
    }

    async fn run_export(
        self: Arc<Self>,
        targets: Vec<i32>,
        destination: ServerTarget,
        requestor: i32,
        init_window: u32,
        task: TaskHandle,
        feedback: Arc<ExportFeedback>,
    ) {
        let previous_status = self.broker.status();
        tracing::info!(
            "Server {} exporting {} to {}",
            self.config.server_id,
            self.config.base_dn,
            destination
        );
        let result = self
            .export_entries(&targets, destination, requestor, init_window, &task, &feedback)
            .await;
        match result {
            Ok(sent) => {
                {
                    let mut stats = self.stats.lock();
                    stats.exports += 1;
                    stats.entries_exported += sent;
                }
                tracing::info!(
                    "Server {} exported {} entries of {} to {}",
                    self.config.server_id,
                    sent,
                    self.config.base_dn,
                    destination
                );
                task.set_progress(sent, 0);
                task.log(format!("Exported {} entries", sent));
                task.complete();
            }
            Err(e) => {
                let remote_failure = feedback.error.lock().is_some();
                if !remote_failure && !self.stop.is_cancelled() {
                    self.send_error(destination, e.result_code(), e.to_string())
                        .await;
                }
                tracing::warn!(
                    "Export of {} to {} failed: {}",
                    self.config.base_dn,
                    destination,
                    e
                );
                task.fail(e.result_code(), format!("Export failed: {}", e));
            }
        }
        if !self.stop.is_cancelled() {
            let status = status_after_total_update(previous_status);
            if let Err(e) = self.broker.signal_status_change(status).await {
                tracing::debug!("Could not announce status {}: {}", status, e);
            }
        }
        self.release_ie(task.id());
    }

    async fn export_entries(
        &self,
        targets: &[i32],
        destination: ServerTarget,
        requestor: i32,
        init_window: u32,
        task: &TaskHandle,
        feedback: &ExportFeedback,
    ) -> Result<u64> {
        let own = self.config.server_id;
        self.broker
            .signal_status_change(ServerStatus::FullUpdate)
            .await?;

        let entry_count = self.backend.count_entries(&self.config.base_dn)?;
        task.set_progress(0, entry_count);
        let announce = InitializeTargetMsg {
            base_dn: self.config.base_dn.clone(),
            sender: own,
            destination,
            requestor,
            entry_count,
            init_window,
            generation_id: self.generation_id(),
            server_state: self.state.snapshot(),
        };
        self.broker
            .publish(ReplicationMessage::InitializeTarget(announce))
            .await?;

        let mut sent = 0u64;
        for entry in self.backend.iterate_entries(&self.config.base_dn)? {
            self.wait_for_export_window(sent, targets, init_window, task, feedback)
                .await?;
            sent += 1;
            self.broker
                .publish(ReplicationMessage::Entry {
                    sender: own,
                    destination,
                    seq: sent,
                    ldif: entry.to_ldif().into_bytes(),
                })
                .await?;
            task.set_progress(sent, entry_count.saturating_sub(sent));
        }

        self.broker
            .publish(ReplicationMessage::Done {
                sender: own,
                destination,
            })
            .await?;
        Ok(sent)
    }

    async fn wait_for_export_window(
        &self,
        sent: u64,
        targets: &[i32],
        init_window: u32,
        task: &TaskHandle,
        feedback: &ExportFeedback,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.total_update_timeout;
        let cancel = task.cancel_token();
        loop {
            let failure = feedback.error.lock().clone();
            if let Some((server, details)) = failure {
                return Err(Error::transfer(format!(
                    "Server {} aborted the import: {}",
                    server, details
                )));
            }
            if self.stop.is_cancelled() {
                return Err(Error::Stopped);
            }
            if cancel.is_cancelled() {
                return Err(Error::transfer("Task cancelled"));
            }
            if sent.saturating_sub(feedback.min_ack(targets)) < u64::from(init_window) {
                return Ok(());
            }
            let connected = self.broker.connected_dss();
            if let Some(gone) = targets.iter().find(|id| !connected.contains(id)) {
                return Err(Error::NoReachablePeer {
                    base_dn: self.config.base_dn.to_string(),
                    server_id: *gone,
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "No import acknowledgment within {:?}",
                    self.config.total_update_timeout
                )));
            }
            tokio::select! {
                _ = feedback.notify.notified() => {}
                _ = cancel.cancelled() => {}
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(EXPORT_POLL_INTERVAL) => {}
            }
        }
    }

    pub(super) fn on_ack(&self, sender: i32, num_ack: u64) {
        let guard = self.ie.lock();
        let Some(IeContext {
            direction: Direction::Export(feedback),
            ..
        }) = guard.as_ref()
        else {
            return;
        };
        {
            let mut acks = feedback.acks.lock();
            let acked = acks.entry(sender).or_insert(0);
            *acked = (*acked).max(num_ack);
        }
        feedback.notify.notify_one();
    }

    pub(super) async fn on_error(&self, sender: i32, code: u32, details: String) {
        enum Target {
            Export,
            Import,
            Unrelated,
        }
        let target = {
            let guard = self.ie.lock();
            match guard.as_ref() {
                Some(IeContext {
                    direction: Direction::Export(feedback),
                    peer,
                    ..
                }) if peer.includes(sender) => {
                    *feedback.error.lock() = Some((sender, details.clone()));
                    feedback.notify.notify_one();
                    Target::Export
                }
                Some(IeContext {
                    direction: Direction::Import(progress),
                    ..
                }) if progress.exporter == sender => Target::Import,
                _ => Target::Unrelated,
            }
        };
        match target {
            Target::Export => {}
            Target::Import => {
                self.abort_import(
                    format!("Server {} reported error {}: {}", sender, code, details),
                    ResultCode::Other,
                    false,
                )
                .await;
            }
            Target::Unrelated => {
                tracing::debug!(
                    "Ignoring error {} from server {} outside a total update: {}",
                    code,
                    sender,
                    details
                );
            }
        }
    }

    pub(super) async fn on_initialize_target(&self, msg: InitializeTargetMsg) {
        let own = self.config.server_id;
        if msg.sender == own
            || !msg.destination.includes(own)
            || msg.base_dn != self.config.base_dn
        {
            return;
        }

        let decision = {
            let mut slot = self.ie.lock();
            match slot.as_mut() {
                Some(IeContext {
                    direction: Direction::Import(progress),
                    task,
                    ..
                }) if progress.exporter == msg.sender && !progress.started => {
                    progress.begin(&msg);
                    TargetDecision::Start(task.clone())
                }
                Some(_) => TargetDecision::Busy,
                None => {
                    // Pushed by the exporter's InitializeTarget task
                    let task = TaskHandle::new(
                        self.config.base_dn.clone(),
                        ServerTarget::Server(msg.sender),
                    );
                    let mut progress = ImportProgress::new(msg.sender);
                    progress.begin(&msg);
                    *slot = Some(IeContext {
                        direction: Direction::Import(progress),
                        peer: ServerTarget::Server(msg.sender),
                        task: task.clone(),
                        previous_status: self.broker.status(),
                    });
                    TargetDecision::Start(task)
                }
            }
        };

        let task = match decision {
            TargetDecision::Start(task) => task,
            TargetDecision::Busy => {
                let refusal = Error::SimultaneousImportExport;
                tracing::warn!(
                    "Server {} refusing total update of {} from server {}: {}",
                    own,
                    self.config.base_dn,
                    msg.sender,
                    refusal
                );
                self.send_error(
                    ServerTarget::Server(msg.sender),
                    refusal.result_code(),
                    refusal.to_string(),
                )
                .await;
                return;
            }
        };

        tracing::info!(
            "Server {} importing {} entries of {} from server {}",
            own,
            msg.entry_count,
            self.config.base_dn,
            msg.sender
        );
        task.log(format!(
            "Receiving about {} entries from server {}",
            msg.entry_count, msg.sender
        ));
        if let Err(e) = self
            .broker
            .signal_status_change(ServerStatus::FullUpdate)
            .await
        {
            tracing::debug!("Could not announce full update status: {}", e);
        }

        {
            let mut slot = self.ie.lock();
            if let Some(IeContext {
                direction: Direction::Import(progress),
                ..
            }) = slot.as_mut()
            {
                progress.cleared = true;
            }
        }
        match self.backend.clear_subtree(&self.config.base_dn) {
            Ok(removed) => {
                tracing::debug!("Cleared {} entries of {}", removed, self.config.base_dn);
                task.set_progress(0, msg.entry_count);
            }
            Err(e) => {
                self.abort_import(
                    format!("Could not clear {}: {}", self.config.base_dn, e),
                    e.result_code(),
                    true,
                )
                .await;
            }
        }
    }

    pub(super) async fn on_entry(&self, sender: i32, seq: u64, ldif: &[u8]) {
        let parsed = std::str::from_utf8(ldif)
            .map_err(|e| Error::InvalidLdif(e.to_string()))
            .and_then(Entry::from_ldif)
            .and_then(|entry| {
                if entry.dn.is_descendant_of(&self.config.base_dn) {
                    Ok(entry)
                } else {
                    Err(Error::InvalidLdif(format!(
                        "{} is outside {}",
                        entry.dn, self.config.base_dn
                    )))
                }
            });

        let outcome: std::result::Result<Option<(i32, u64)>, Error> = {
            let mut slot = self.ie.lock();
            let Some(IeContext {
                direction: Direction::Import(progress),
                task,
                ..
            }) = slot.as_mut()
            else {
                return;
            };
            if progress.exporter != sender || !progress.started {
                return;
            }
            progress.last_activity = Instant::now();
            if seq != progress.received + 1 {
                Err(Error::transfer(format!(
                    "Entry {} received after entry {}",
                    seq, progress.received
                )))
            } else {
                match parsed.and_then(|entry| self.backend.put_entry(entry)) {
                    Ok(()) => {
                        progress.received += 1;
                        task.set_progress(
                            progress.received,
                            progress.expected.saturating_sub(progress.received),
                        );
                        if progress.received - progress.last_ack >= progress.ack_every() {
                            progress.last_ack = progress.received;
                            Ok(Some((progress.exporter, progress.received)))
                        } else {
                            Ok(None)
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(Some((exporter, num_ack))) => {
                let ack = ReplicationMessage::InitializeRcvAck {
                    sender: self.config.server_id,
                    destination: ServerTarget::Server(exporter),
                    num_ack,
                };
                if let Err(e) = self.broker.publish(ack).await {
                    tracing::debug!("Could not acknowledge entries to {}: {}", exporter, e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.abort_import(format!("Import failed: {}", e), e.result_code(), true)
                    .await;
            }
        }
    }

    pub(super) async fn on_done(&self, sender: i32) {
        let finished = {
            let mut slot = self.ie.lock();
            let matches = matches!(
                slot.as_ref(),
                Some(IeContext {
                    direction: Direction::Import(progress),
                    ..
                }) if progress.exporter == sender && progress.started
            );
            if !matches {
                return;
            }
            let Some(IeContext {
                direction: Direction::Import(progress),
                task,
                ..
            }) = slot.take()
            else {
                return;
            };
            // Adopt the exporter's state before the slot frees up for local writes
            self.state.replace_with(progress.server_state.clone());
            for (_, csn) in progress.server_state.iter() {
                self.generator.adjust(&csn);
            }
            self.generation_id
                .store(progress.generation_id, std::sync::atomic::Ordering::SeqCst);
            self.own_log.clear();
            self.pending.lock().clear();
            self.backend.set_inconsistent(false);
            if let Err(e) = self.save_state() {
                tracing::error!("Failed to save state of {}: {}", self.config.base_dn, e);
            }
            self.broker.set_generation_id(progress.generation_id);
            {
                let mut stats = self.stats.lock();
                stats.imports += 1;
                stats.entries_imported += progress.received;
            }
            (progress, task)
        };
        let (progress, task) = finished;

        tracing::info!(
            "Server {} imported {} entries of {} from server {} (generation ID {})",
            self.config.server_id,
            progress.received,
            self.config.base_dn,
            sender,
            progress.generation_id
        );
        if let Err(e) = self
            .broker
            .signal_status_change(ServerStatus::Normal)
            .await
        {
            tracing::debug!("Could not announce normal status: {}", e);
        }
        // New session so the relay re-evaluates the generation ID and
        // resends changes newer than the adopted ServerState
        self.broker.restart();
        // The announced count is an estimate; the stream is authoritative
        task.set_progress(progress.received, 0);
        task.log(format!("Imported {} entries", progress.received));
        task.complete();
    }

    /// Abort a running import: mark the data inconsistent if it was touched
    async fn abort_import(&self, reason: String, code: ResultCode, notify_exporter: bool) {
        let ctx = {
            let mut slot = self.ie.lock();
            match slot.as_ref() {
                Some(IeContext {
                    direction: Direction::Import(_),
                    ..
                }) => slot.take(),
                _ => None,
            }
        };
        let Some(ctx) = ctx else {
            return;
        };
        let Direction::Import(progress) = &ctx.direction else {
            return;
        };

        tracing::warn!(
            "Import of {} from server {} aborted: {}",
            self.config.base_dn,
            progress.exporter,
            reason
        );
        if progress.cleared {
            self.backend.set_inconsistent(true);
            if let Err(e) = self.save_state() {
                tracing::error!("Failed to save state of {}: {}", self.config.base_dn, e);
            }
        }
        let stopped = self.stop.is_cancelled();
        if notify_exporter && !stopped {
            self.send_error(ServerTarget::Server(progress.exporter), code, reason.clone())
                .await;
        }
        ctx.task.fail(code, reason);
        if stopped {
            return;
        }
        if progress.started {
            let status = status_after_total_update(ctx.previous_status);
            if let Err(e) = self.broker.signal_status_change(status).await {
                tracing::debug!("Could not announce status {}: {}", status, e);
            }
        }
        // Catch up on the updates dropped while the import was pending
        self.broker.restart();
    }

    /// Abort an import that went silent or whose task was cancelled
    pub(super) async fn check_total_update_progress(&self) {
        let expired = {
            let slot = self.ie.lock();
            match slot.as_ref() {
                Some(IeContext {
                    direction: Direction::Import(progress),
                    task,
                    ..
                }) => {
                    if task.is_cancelled() {
                        Some((ResultCode::Other, "Import task cancelled".to_string()))
                    } else if progress.last_activity.elapsed() >= self.config.total_update_timeout {
                        Some((
                            ResultCode::TimeLimitExceeded,
                            format!(
                                "No data from server {} within {:?}",
                                progress.exporter, self.config.total_update_timeout
                            ),
                        ))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some((code, reason)) = expired {
            self.abort_import(reason, code, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_ack_over_targets() {
        let feedback = ExportFeedback::default();
        assert_eq!(feedback.min_ack(&[]), u64::MAX);
        assert_eq!(feedback.min_ack(&[2, 3]), 0);
        feedback.acks.lock().insert(2, 10);
        feedback.acks.lock().insert(3, 4);
        assert_eq!(feedback.min_ack(&[2, 3]), 4);
        assert_eq!(feedback.min_ack(&[2]), 10);
    }

    #[test]
    fn test_ack_every_half_window() {
        let mut progress = ImportProgress::new(2);
        progress.init_window = 100;
        assert_eq!(progress.ack_every(), 50);
        progress.init_window = 1;
        assert_eq!(progress.ack_every(), 1);
    }

    #[test]
    fn test_status_after_total_update() {
        assert_eq!(
            status_after_total_update(ServerStatus::NotConnected),
            ServerStatus::Normal
        );
        assert_eq!(
            status_after_total_update(ServerStatus::BadGenerationId),
            ServerStatus::BadGenerationId
        );
    }
}
