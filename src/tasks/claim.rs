use std::collections::BTreeSet;

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::error::{DashError, Result};
use crate::presence::SessionId;
use crate::tasks::lifecycle::{Actor, TaskLifecycle, Transition};
use crate::tasks::store::TaskStore;
use crate::tasks::task::{TaskId, TaskRecord, TaskStatus};

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker is now the task's exclusive owner.
    Won(TaskRecord),
    /// Another worker got there first, or the task is no longer pending.
    Lost,
}

/// Races a worker for pending tasks.
///
/// A claim is a single compare-and-set that moves `status` from `pending` to
/// `claimed` and writes `workerId` in the same record write, guarded on the
/// stored task still being `pending` with no owner. Exactly one of any number
/// of concurrent attempts on a task is accepted; the others observe
/// [`ClaimOutcome::Lost`] and move on without retrying.
#[derive(Clone)]
pub struct ClaimProtocol {
    tasks: TaskStore,
    worker_id: SessionId,
    capabilities: BTreeSet<String>,
}

impl ClaimProtocol {
    pub fn new(tasks: TaskStore, worker_id: SessionId, capabilities: BTreeSet<String>) -> Self {
        Self {
            tasks,
            worker_id,
            capabilities,
        }
    }

    pub fn worker_id(&self) -> &SessionId {
        &self.worker_id
    }

    /// Whether this worker can execute the task at all.
    pub fn can_run(&self, task: &TaskRecord) -> bool {
        self.capabilities.contains(&task.language)
    }

    pub async fn try_claim(&self, task_id: &TaskId) -> Result<ClaimOutcome> {
        let Some(current) = self.tasks.get(task_id).await? else {
            return Err(DashError::TaskNotFound(task_id.clone()));
        };
        self.claim_observed(&current).await
    }

    /// Claim a task in the state it was last observed in. No read is made:
    /// if the observation is stale the compare-and-set rejects it.
    pub async fn claim_observed(&self, observed: &TaskRecord) -> Result<ClaimOutcome> {
        if observed.status != TaskStatus::Pending || observed.worker_id.is_some() {
            return Ok(ClaimOutcome::Lost);
        }

        let claimed = TaskLifecycle::apply(
            observed,
            Transition::Claim,
            &Actor::Worker(self.worker_id.clone()),
            Utc::now(),
        )?;

        if self.tasks.write_if_unchanged(observed, &claimed).await? {
            tracing::info!(task_id = %observed.task_id, worker_id = %self.worker_id, "Task claimed");
            Ok(ClaimOutcome::Won(claimed))
        } else {
            tracing::debug!(task_id = %observed.task_id, worker_id = %self.worker_id, "Claim lost");
            Ok(ClaimOutcome::Lost)
        }
    }

    /// Try the runnable tasks of a pending snapshot in random order and stop
    /// at the first win. Returns `None` when every attempt lost.
    pub async fn claim_any(&self, pending: &[TaskRecord]) -> Result<Option<TaskRecord>> {
        let mut candidates: Vec<&TaskRecord> =
            pending.iter().filter(|t| self.can_run(t)).collect();
        // Spread concurrent workers over the pending set instead of all
        // colliding on the oldest task.
        candidates.shuffle(&mut rand::thread_rng());

        for task in candidates {
            if let ClaimOutcome::Won(record) = self.claim_observed(task).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
