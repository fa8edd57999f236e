//! Submitting side of the network.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};
use crate::identity::AccountId;
use crate::presence::{PresenceRegistry, Registration, SessionId};
use crate::store::{ConnectionState, StoreRef};
use crate::tasks::{TaskId, TaskRecord, TaskStatus, TaskStore, TaskWatch, DEFAULT_LANGUAGE};
use crate::worker::{ExecutionError, Sandbox};

/// What the submitting side can currently say about a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Not finished yet: pending, claimed or running.
    Waiting(TaskStatus),
    Finished(TaskRecord),
    /// The store is unreachable; the last known state may be stale.
    Offline,
}

/// Follows submitted tasks until they reach a terminal state.
#[derive(Clone)]
pub struct ClientObserver {
    tasks: TaskStore,
}

impl ClientObserver {
    pub fn new(tasks: TaskStore) -> Self {
        Self { tasks }
    }

    pub fn observe(&self, task_id: &TaskId) -> TaskWatch {
        self.tasks.watch(task_id)
    }

    /// Wait for the task's terminal record. There is no built-in timeout;
    /// dropping the future cancels the wait and releases the subscription.
    pub async fn await_result(&self, task_id: &TaskId) -> Result<TaskRecord> {
        let mut watch = self.tasks.watch(task_id);
        while let Some(record) = watch.next().await {
            tracing::debug!(task_id = %task_id, status = %record.status, "Task update");
            if record.status.is_terminal() {
                return Ok(record);
            }
        }
        Err(DashError::TaskNotFound(task_id.clone()))
    }

    pub async fn progress(&self, task_id: &TaskId) -> Result<Progress> {
        if !self.tasks.is_connected() {
            return Ok(Progress::Offline);
        }
        match self.tasks.fetch(task_id).await {
            Ok(record) if record.status.is_terminal() => Ok(Progress::Finished(record)),
            Ok(record) => Ok(Progress::Waiting(record.status)),
            Err(DashError::StoreUnavailable) => Ok(Progress::Offline),
            Err(e) => Err(e),
        }
    }
}

/// A client participant: registers presence and submits code to the network
/// or runs it locally.
pub struct Client {
    session_id: SessionId,
    registry: PresenceRegistry,
    tasks: TaskStore,
    sandbox: Arc<dyn Sandbox>,
}

impl Client {
    pub async fn connect(store: StoreRef, sandbox: Arc<dyn Sandbox>) -> Result<Self> {
        Self::connect_as(store, sandbox, None).await
    }

    pub async fn connect_as(
        store: StoreRef,
        sandbox: Arc<dyn Sandbox>,
        account_id: Option<AccountId>,
    ) -> Result<Self> {
        let registry = PresenceRegistry::new(store.clone());
        let mut registration = Registration::client();
        if let Some(account_id) = account_id {
            registration = registration.with_account(account_id);
        }
        let session_id = registry.register_with(registration).await?;

        Ok(Self {
            session_id,
            registry,
            tasks: TaskStore::new(store),
            sandbox,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn is_online(&self) -> bool {
        self.tasks.is_connected()
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectionState> {
        self.registry.connectivity()
    }

    /// Keep this client's presence armed across reconnects until `token` is cancelled.
    pub fn keep_alive(&self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.registry.clone().maintain(token))
    }

    pub fn observer(&self) -> ClientObserver {
        ClientObserver::new(self.tasks.clone())
    }

    /// Offload code to the network. Refused with `StoreUnavailable` while offline.
    pub async fn submit(&self, code: &str) -> Result<TaskId> {
        self.submit_with_language(code, DEFAULT_LANGUAGE).await
    }

    pub async fn submit_with_language(&self, code: &str, language: &str) -> Result<TaskId> {
        if code.trim().is_empty() {
            return Err(DashError::InvalidInput("code must not be empty".to_string()));
        }
        if !self.is_online() {
            tracing::warn!(session_id = %self.session_id, "Cannot submit while offline");
            return Err(DashError::StoreUnavailable);
        }
        self.tasks
            .submit_with_language(&self.session_id, code, language)
            .await
    }

    pub async fn await_result(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.observer().await_result(task_id).await
    }

    /// Run code in the local sandbox without touching the network.
    pub async fn run_locally(&self, code: &str) -> std::result::Result<String, ExecutionError> {
        self.sandbox.execute(code).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.registry.teardown(&self.session_id).await
    }
}
