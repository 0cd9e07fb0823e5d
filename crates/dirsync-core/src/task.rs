//! Administrative total-update tasks
//!
//! [`InitializeTask`] imports a domain from a remote server,
//! [`InitializeTargetTask`] exports it to one or all remote servers. Both
//! resolve the domain through a [`DomainRegistry`] and hand back a
//! [`TaskHandle`] whose progress is observable through a watch channel.

use crate::backend::{Dn, ResultCode};
use crate::protocol::ServerTarget;
use crate::registry::DomainRegistry;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Transfer in progress
    Running,
    /// Terminal: transfer finished
    CompletedSuccessfully,
    /// Terminal: transfer failed, timed out or was cancelled
    StoppedByError,
}

impl TaskState {
    /// Whether no further change will happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Observable task attributes
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    /// Domain the task runs against
    pub domain_dn: Dn,
    /// Import source or export target
    pub peer: ServerTarget,
    /// Current state
    pub state: TaskState,
    /// Result code, set at the terminal state
    pub result_code: Option<ResultCode>,
    /// Human readable log
    pub log_messages: Vec<String>,
    /// Entries transferred so far
    pub entries_done: u64,
    /// Entries still expected
    pub entries_left: u64,
    /// Set exactly once, at the terminal state
    pub completion_time: Option<DateTime<Utc>>,
}

struct TaskInner {
    id: Uuid,
    progress: watch::Sender<TaskProgress>,
    cancel: CancellationToken,
}

/// Shared handle on a running task
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    /// New running task
    pub fn new(domain_dn: Dn, peer: ServerTarget) -> Self {
        let (progress, _) = watch::channel(TaskProgress {
            domain_dn,
            peer,
            state: TaskState::Running,
            result_code: None,
            log_messages: Vec::new(),
            entries_done: 0,
            entries_left: 0,
            completion_time: None,
        });
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4(),
                progress,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Task id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current progress
    pub fn progress(&self) -> TaskProgress {
        self.inner.progress.borrow().clone()
    }

    /// Watch progress changes
    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.inner.progress.subscribe()
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.inner.progress.borrow().state
    }

    /// Whether the task was cancelled (administrative timeout or stop)
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the task must stop
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Update the entry counters
    pub fn set_progress(&self, entries_done: u64, entries_left: u64) {
        self.inner.progress.send_if_modified(|p| {
            if p.state.is_terminal() {
                return false;
            }
            p.entries_done = entries_done;
            p.entries_left = entries_left;
            true
        });
    }

    /// Append a log message
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.progress.send_modify(|p| p.log_messages.push(message));
    }

    /// Terminal success; ignored when already terminal
    pub fn complete(&self) {
        self.finish(TaskState::CompletedSuccessfully, ResultCode::Success, None);
    }

    /// Terminal failure; ignored when already terminal
    pub fn fail(&self, code: ResultCode, message: impl Into<String>) {
        self.finish(TaskState::StoppedByError, code, Some(message.into()));
    }

    fn finish(&self, state: TaskState, code: ResultCode, message: Option<String>) {
        let changed = self.inner.progress.send_if_modified(|p| {
            if p.state.is_terminal() {
                return false;
            }
            p.state = state;
            p.result_code = Some(code);
            if let Some(message) = message {
                p.log_messages.push(message);
            }
            p.completion_time = Some(Utc::now());
            true
        });
        if changed && state == TaskState::StoppedByError {
            self.inner.cancel.cancel();
        }
    }

    /// Wait for a terminal state
    ///
    /// On timeout the task is stopped with `TimeLimitExceeded` and cancelled.
    pub async fn wait(&self, timeout: Duration) -> TaskProgress {
        let mut rx = self.subscribe();
        let timed_out = tokio::time::timeout(timeout, rx.wait_for(|p| p.state.is_terminal()))
            .await
            .is_err();
        if timed_out {
            self.fail(
                ResultCode::TimeLimitExceeded,
                format!("Task did not complete within {:?}", timeout),
            );
        }
        self.progress()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.inner.progress.borrow();
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("domain_dn", &progress.domain_dn)
            .field("state", &progress.state)
            .finish()
    }
}

fn resolve_domain(
    registry: &DomainRegistry,
    domain_dn: &str,
) -> Result<Arc<crate::domain::ReplicationDomain>> {
    let dn = Dn::parse(domain_dn)?;
    registry
        .get(&dn)
        .ok_or_else(|| Error::NoMatchingDomain(domain_dn.to_string()))
}

/// Import a domain from a remote server
#[derive(Debug, Clone)]
pub struct InitializeTask {
    /// Domain base DN as entered by the administrator
    pub domain_dn: String,
    /// Server to import from, or any reachable one
    pub source: ServerTarget,
}

impl InitializeTask {
    /// Describe an import
    pub fn new(domain_dn: impl Into<String>, source: ServerTarget) -> Self {
        Self {
            domain_dn: domain_dn.into(),
            source,
        }
    }

    /// Validate and start; administrative errors fail synchronously
    pub async fn start(&self, registry: &DomainRegistry) -> Result<TaskHandle> {
        let domain = resolve_domain(registry, &self.domain_dn)?;
        domain.initialize_from_remote(self.source).await
    }
}

/// Export a domain to one or all remote servers
#[derive(Debug, Clone)]
pub struct InitializeTargetTask {
    /// Domain base DN as entered by the administrator
    pub domain_dn: String,
    /// Server(s) to export to
    pub target: ServerTarget,
}

impl InitializeTargetTask {
    /// Describe an export
    pub fn new(domain_dn: impl Into<String>, target: ServerTarget) -> Self {
        Self {
            domain_dn: domain_dn.into(),
            target,
        }
    }

    /// Validate and start; administrative errors fail synchronously
    pub async fn start(&self, registry: &DomainRegistry) -> Result<TaskHandle> {
        let domain = resolve_domain(registry, &self.domain_dn)?;
        domain.initialize_remote(self.target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TaskHandle {
        TaskHandle::new(Dn::parse("dc=example,dc=com").unwrap(), ServerTarget::Server(2))
    }

    #[test]
    fn test_completion_time_set_once() {
        let task = handle();
        task.set_progress(3, 7);
        task.complete();
        let done = task.progress();
        assert_eq!(done.state, TaskState::CompletedSuccessfully);
        assert_eq!(done.result_code, Some(ResultCode::Success));
        let first = done.completion_time.unwrap();

        task.fail(ResultCode::Other, "late failure");
        task.set_progress(10, 0);
        let after = task.progress();
        assert_eq!(after.state, TaskState::CompletedSuccessfully);
        assert_eq!(after.completion_time, Some(first));
        assert_eq!(after.entries_done, 3);
    }

    #[test]
    fn test_failure_cancels() {
        let task = handle();
        task.fail(ResultCode::Other, "boom");
        assert!(task.is_cancelled());
        let progress = task.progress();
        assert_eq!(progress.state, TaskState::StoppedByError);
        assert_eq!(progress.log_messages, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_timeout_stops_task() {
        let task = handle();
        let progress = task.wait(Duration::from_millis(20)).await;
        assert_eq!(progress.state, TaskState::StoppedByError);
        assert_eq!(progress.result_code, Some(ResultCode::TimeLimitExceeded));
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_observes_completion() {
        let task = handle();
        let finisher = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            finisher.complete();
        });
        let progress = task.wait(Duration::from_secs(5)).await;
        assert_eq!(progress.state, TaskState::CompletedSuccessfully);
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let registry = DomainRegistry::new();
        let err = InitializeTask::new("dc=foo", ServerTarget::Server(2))
            .start(&registry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchingDomain(_)));

        let err = InitializeTargetTask::new("foo", ServerTarget::All)
            .start(&registry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDn(_)));
        assert_eq!(err.result_code(), ResultCode::InvalidDnSyntax);
    }
}
