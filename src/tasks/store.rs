use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};
use crate::presence::SessionId;
use crate::store::{record_path, Change, Guard, StoreRef, Subscription, TASKS};
use crate::tasks::lifecycle::{Actor, TaskLifecycle, Transition};
use crate::tasks::task::{TaskId, TaskRecord, TaskStatus, DEFAULT_LANGUAGE};

/// Task records under `tasks/{taskId}`.
///
/// Creation is append-only. Every later write goes through
/// [`TaskLifecycle::apply`] and is committed with a compare-and-set guarded on
/// the `status` and `workerId` the caller observed, so two writers racing on
/// the same task can never both succeed.
#[derive(Clone)]
pub struct TaskStore {
    store: StoreRef,
}

impl TaskStore {
    pub fn new(store: StoreRef) -> Self {
        Self { store }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub async fn submit(&self, submitter_id: &SessionId, code: &str) -> Result<TaskId> {
        self.submit_with_language(submitter_id, code, DEFAULT_LANGUAGE)
            .await
    }

    pub async fn submit_with_language(
        &self,
        submitter_id: &SessionId,
        code: &str,
        language: &str,
    ) -> Result<TaskId> {
        if code.trim().is_empty() {
            return Err(DashError::InvalidInput("code must not be empty".to_string()));
        }
        if language.trim().is_empty() {
            return Err(DashError::InvalidInput(
                "language must not be empty".to_string(),
            ));
        }

        let task_id = TaskId::parse(self.store.push_key(TASKS).await?)?;
        let record = TaskRecord::new(
            task_id.clone(),
            submitter_id.clone(),
            code.to_string(),
            language.to_string(),
            Utc::now(),
        );
        self.store
            .set(&task_path(&task_id), serde_json::to_value(&record)?)
            .await?;

        tracing::info!(
            task_id = %task_id,
            submitter_id = %submitter_id,
            language,
            "Task submitted"
        );
        Ok(task_id)
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>> {
        match self.store.get(&task_path(task_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.get(task_id)
            .await?
            .ok_or_else(|| DashError::TaskNotFound(task_id.clone()))
    }

    /// Every task, in submission order.
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let entries = self.store.list(TASKS).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| decode(&key, value))
            .collect())
    }

    pub async fn pending(&self) -> Result<Vec<TaskRecord>> {
        self.with_status(|s| s == TaskStatus::Pending).await
    }

    /// Claimed or running tasks.
    pub async fn in_flight(&self) -> Result<Vec<TaskRecord>> {
        self.with_status(|s| s.is_in_flight()).await
    }

    /// The `limit` most recently created tasks, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.list().await?;
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn with_status(&self, keep: impl Fn(TaskStatus) -> bool) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| keep(t.status))
            .collect())
    }

    /// Successive states of one task, starting with the current one.
    pub fn watch(&self, task_id: &TaskId) -> TaskWatch {
        TaskWatch {
            tasks: self.clone(),
            task_id: task_id.clone(),
            subscription: self.store.subscribe(&task_path(task_id)),
            primed: false,
            last: None,
            finished: false,
        }
    }

    /// The pending set, re-delivered on every change to the task collection.
    pub fn watch_pending(&self) -> PendingWatch {
        PendingWatch {
            tasks: self.clone(),
            subscription: self.store.subscribe(TASKS),
            primed: false,
        }
    }

    pub async fn start(&self, task_id: &TaskId, worker_id: &SessionId) -> Result<TaskRecord> {
        self.advance(task_id, Transition::Start, Actor::Worker(worker_id.clone()))
            .await
    }

    pub async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &SessionId,
        output: String,
    ) -> Result<TaskRecord> {
        self.advance(
            task_id,
            Transition::Complete(output),
            Actor::Worker(worker_id.clone()),
        )
        .await
    }

    pub async fn fail(
        &self,
        task_id: &TaskId,
        worker_id: &SessionId,
        output: String,
    ) -> Result<TaskRecord> {
        self.advance(
            task_id,
            Transition::Fail(output),
            Actor::Worker(worker_id.clone()),
        )
        .await
    }

    /// Hand an owned, unfinished task back to the pending set.
    pub async fn release(&self, task_id: &TaskId, worker_id: &SessionId) -> Result<TaskRecord> {
        let released = self
            .advance(task_id, Transition::Requeue, Actor::Worker(worker_id.clone()))
            .await?;
        tracing::info!(task_id = %task_id, worker_id = %worker_id, "Task released by owner");
        Ok(released)
    }

    /// System requeue of a task observed in `observed` state. Returns `None`
    /// when the task moved on since it was observed.
    pub async fn requeue(&self, observed: &TaskRecord) -> Result<Option<TaskRecord>> {
        let next = TaskLifecycle::apply(observed, Transition::Requeue, &Actor::System, Utc::now())?;
        if self.write_if_unchanged(observed, &next).await? {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Commit `next` only if the stored task still has the `status` and
    /// `workerId` of `observed`.
    pub(crate) async fn write_if_unchanged(
        &self,
        observed: &TaskRecord,
        next: &TaskRecord,
    ) -> Result<bool> {
        let owner = observed
            .worker_id
            .as_ref()
            .map_or(Value::Null, |w| Value::String(w.as_str().to_string()));
        let guard = Guard::field("status", observed.status.as_str()).and("workerId", owner);
        self.store
            .compare_and_set(
                &task_path(&observed.task_id),
                &guard,
                serde_json::to_value(next)?,
            )
            .await
    }

    async fn advance(
        &self,
        task_id: &TaskId,
        transition: Transition,
        actor: Actor,
    ) -> Result<TaskRecord> {
        let target = transition.target();
        let current = self.fetch(task_id).await?;
        let next = TaskLifecycle::apply(&current, transition, &actor, Utc::now())?;

        if self.write_if_unchanged(&current, &next).await? {
            tracing::debug!(task_id = %task_id, from = %current.status, to = %target, "Task transitioned");
            return Ok(next);
        }

        // Lost a race (usually a requeue); report against the state that won.
        let latest = self.fetch(task_id).await?;
        Err(DashError::InvalidTransition {
            task_id: task_id.clone(),
            from: latest.status,
            to: target,
        })
    }
}

fn task_path(task_id: &TaskId) -> String {
    record_path(TASKS, task_id.as_str())
}

fn decode(key: &str, value: Value) -> Option<TaskRecord> {
    match serde_json::from_value::<TaskRecord>(value) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(key, error = %e, "Skipping malformed task record");
            None
        }
    }
}

/// Successive states of a single task.
///
/// The stream ends after the first terminal state is delivered, or at once if
/// the task does not exist, and releases its subscription at that point.
/// Dropping it earlier releases it as well.
pub struct TaskWatch {
    tasks: TaskStore,
    task_id: TaskId,
    subscription: Subscription,
    primed: bool,
    last: Option<TaskRecord>,
    finished: bool,
}

impl TaskWatch {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn cancel(&mut self) {
        self.finished = true;
        self.subscription.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.subscription.cancellation_token()
    }

    pub async fn next(&mut self) -> Option<TaskRecord> {
        if self.finished {
            return None;
        }

        if !self.primed {
            self.primed = true;
            match self.tasks.get(&self.task_id).await {
                Ok(Some(record)) => return Some(self.deliver(record)),
                Ok(None) => {
                    tracing::debug!(task_id = %self.task_id, "Watched task does not exist");
                    self.cancel();
                    return None;
                }
                // Offline: wait for the resync.
                Err(_) => {}
            }
        }

        loop {
            let record = match self.subscription.next().await? {
                Change::Set { value, .. } => match serde_json::from_value::<TaskRecord>(value) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(task_id = %self.task_id, error = %e, "Malformed task update");
                        continue;
                    }
                },
                Change::Removed { .. } => {
                    self.cancel();
                    return None;
                }
                Change::Resync => match self.tasks.get(&self.task_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) | Err(_) => continue,
                },
            };

            if self.last.as_ref() == Some(&record) {
                continue;
            }
            return Some(self.deliver(record));
        }
    }

    fn deliver(&mut self, record: TaskRecord) -> TaskRecord {
        if record.status.is_terminal() {
            self.cancel();
        }
        self.last = Some(record.clone());
        record
    }
}

/// The current pending set, re-read on every change to the task collection.
pub struct PendingWatch {
    tasks: TaskStore,
    subscription: Subscription,
    primed: bool,
}

impl PendingWatch {
    pub fn cancel(&mut self) {
        self.subscription.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.subscription.cancellation_token()
    }

    pub async fn next(&mut self) -> Option<Vec<TaskRecord>> {
        if !self.primed {
            self.primed = true;
            if let Ok(pending) = self.tasks.pending().await {
                return Some(pending);
            }
        }
        loop {
            self.subscription.next().await?;
            match self.tasks.pending().await {
                Ok(pending) => return Some(pending),
                Err(DashError::StoreUnavailable) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read pending tasks");
                    continue;
                }
            }
        }
    }
}
