use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};
use crate::presence::PresenceRegistry;
use crate::tasks::store::TaskStore;
use crate::tasks::task::{TaskRecord, TaskStatus};

/// Returns orphaned tasks to the pending set.
///
/// A claimed or running task is orphaned when its `workerId` no longer has a
/// presence record. Requeue is the only way a task's status moves backwards;
/// each requeue is a compare-and-set against the state the reconciler read, so
/// running several reconcilers at once is safe.
#[derive(Clone)]
pub struct Reconciler {
    tasks: TaskStore,
    presence: PresenceRegistry,
    stale_running_after: Option<Duration>,
}

impl Reconciler {
    pub fn new(tasks: TaskStore, presence: PresenceRegistry) -> Self {
        Self {
            tasks,
            presence,
            stale_running_after: None,
        }
    }

    /// Also requeue `running` tasks that have not been updated for `after`,
    /// even when their owner is still present.
    pub fn with_stale_running_after(mut self, after: Duration) -> Self {
        self.stale_running_after = Some(after);
        self
    }

    fn is_stale(&self, task: &TaskRecord) -> bool {
        let Some(after) = self.stale_running_after else {
            return false;
        };
        if task.status != TaskStatus::Running {
            return false;
        }
        let age = Utc::now().signed_duration_since(task.updated_at);
        age.to_std().map_or(false, |age| age >= after)
    }

    /// One reconciliation pass. Returns the number of tasks requeued.
    pub async fn reconcile_once(&self) -> Result<usize> {
        // Tasks first: every owner in this snapshot registered before it, and
        // session ids are never reused, so absence from the later read is final.
        let in_flight = self.tasks.in_flight().await?;
        let live = self.presence.live_sessions().await?;

        let mut requeued = 0;
        for task in in_flight {
            let orphaned = task.worker_id.as_ref().map_or(true, |w| !live.contains(w));
            if !orphaned && !self.is_stale(&task) {
                continue;
            }

            match self.tasks.requeue(&task).await? {
                Some(_) => {
                    requeued += 1;
                    tracing::info!(
                        task_id = %task.task_id,
                        worker_id = ?task.worker_id.as_ref().map(|w| w.as_str()),
                        from = %task.status,
                        orphaned,
                        "Task requeued"
                    );
                }
                None => {
                    tracing::debug!(task_id = %task.task_id, "Task moved on before requeue");
                }
            }
        }

        if requeued > 0 {
            tracing::info!(requeued, "Reconciliation pass requeued tasks");
        } else {
            tracing::debug!(requeued, "Reconciliation pass found no orphaned tasks");
        }
        Ok(requeued)
    }

    /// Run a pass every `interval` until cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(_) => {}
                        Err(DashError::StoreUnavailable) => {
                            tracing::debug!("Store offline, skipping reconciliation pass");
                        }
                        Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
            }
        }
    }
}
