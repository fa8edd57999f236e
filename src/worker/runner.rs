use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};
use crate::presence::{NodeStatus, PresenceRegistry, Registration, SessionId};
use crate::tasks::{ClaimProtocol, TaskRecord, TaskStore};
use crate::worker::executor::Sandbox;

/// How a claimed task ended from this worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Recorded,
    Released,
    Lost,
}

/// A worker participant: advertises itself, reacts to the pending set, claims
/// tasks one at a time and runs them in the sandbox.
pub struct Worker {
    registry: PresenceRegistry,
    tasks: TaskStore,
    sandbox: Arc<dyn Sandbox>,
    registration: Registration,
}

impl Worker {
    pub fn new(
        registry: PresenceRegistry,
        tasks: TaskStore,
        sandbox: Arc<dyn Sandbox>,
        registration: Registration,
    ) -> Self {
        Self {
            registry,
            tasks,
            sandbox,
            registration,
        }
    }

    /// Register and work until `token` is cancelled. A task in progress when
    /// cancellation arrives is released back to the pending set.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let capabilities = self.registration.capabilities.clone();
        let session_id = self.registry.register_with(self.registration.clone()).await?;
        let claims = ClaimProtocol::new(self.tasks.clone(), session_id.clone(), capabilities);
        let mut pending = self.tasks.watch_pending();
        let keeper_token = token.child_token();
        let keeper = tokio::spawn(self.registry.clone().maintain(keeper_token.clone()));

        tracing::info!(worker_id = %session_id, "Worker started");

        loop {
            let snapshot = tokio::select! {
                _ = token.cancelled() => break,
                snapshot = pending.next() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            let mut candidates = snapshot;
            while !token.is_cancelled() {
                let claimed = match claims.claim_any(&candidates).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(DashError::StoreUnavailable) => break,
                    Err(e) => {
                        tracing::warn!(worker_id = %session_id, error = %e, "Claim attempt failed");
                        break;
                    }
                };

                self.execute_claimed(&session_id, claimed, &token).await;

                // Work may have queued up while this one ran.
                candidates = match self.tasks.pending().await {
                    Ok(pending) => pending,
                    Err(_) => break,
                };
            }
        }

        pending.cancel();
        keeper_token.cancel();
        let _ = keeper.await;
        if let Err(e) = self.registry.teardown(&session_id).await {
            tracing::warn!(worker_id = %session_id, error = %e, "Presence teardown failed");
        }
        tracing::info!(worker_id = %session_id, "Worker stopped");
        Ok(())
    }

    async fn execute_claimed(
        &self,
        session_id: &SessionId,
        task: TaskRecord,
        token: &CancellationToken,
    ) {
        self.set_status(session_id, NodeStatus::Busy).await;
        let finish = self.drive(session_id, &task, token).await;
        tracing::debug!(task_id = %task.task_id, ?finish, "Task handled");
        self.set_status(session_id, NodeStatus::Idle).await;
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        task: &TaskRecord,
        token: &CancellationToken,
    ) -> Finish {
        let task_id = &task.task_id;

        if token.is_cancelled() {
            return self.release(session_id, task).await;
        }

        let running = match self.tasks.start(task_id, session_id).await {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Could not start claimed task");
                return Finish::Lost;
            }
        };

        let result = tokio::select! {
            result = self.sandbox.execute(&running.code) => result,
            _ = token.cancelled() => return self.release(session_id, task).await,
        };

        let written = match result {
            Ok(output) => self.tasks.complete(task_id, session_id, output).await,
            Err(error) => {
                tracing::info!(task_id = %task_id, error = %error, "Execution failed");
                self.tasks.fail(task_id, session_id, error.to_string()).await
            }
        };

        match written {
            Ok(record) => {
                tracing::info!(task_id = %task_id, status = %record.status, "Task finished");
                Finish::Recorded
            }
            Err(e) => {
                // Typically requeued and reclaimed while we were executing.
                tracing::warn!(task_id = %task_id, error = %e, "Result discarded");
                Finish::Lost
            }
        }
    }

    async fn release(&self, session_id: &SessionId, task: &TaskRecord) -> Finish {
        match self.tasks.release(&task.task_id, session_id).await {
            Ok(_) => Finish::Released,
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Could not release task");
                Finish::Lost
            }
        }
    }

    async fn set_status(&self, session_id: &SessionId, status: NodeStatus) {
        if let Err(e) = self.registry.set_status(session_id, status).await {
            tracing::debug!(worker_id = %session_id, status = %status, error = %e, "Status update skipped");
        }
    }
}
