use chrono::{DateTime, Utc};

use crate::error::{DashError, Result};
use crate::presence::SessionId;
use crate::tasks::task::{TaskRecord, TaskStatus};

/// A requested change to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Claim,
    Start,
    Complete(String),
    Fail(String),
    Requeue,
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Claim => TaskStatus::Claimed,
            Transition::Start => TaskStatus::Running,
            Transition::Complete(_) => TaskStatus::Completed,
            Transition::Fail(_) => TaskStatus::Failed,
            Transition::Requeue => TaskStatus::Pending,
        }
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Worker(SessionId),
    /// The reconciler acting on behalf of the network.
    System,
}

/// The task state machine.
///
/// ```text
/// pending -> claimed -> running -> completed | failed
/// claimed | running -> pending   (requeue)
/// ```
///
/// Only a worker may claim. Only the recorded owner may start, complete or
/// fail. Requeue is applied by the system, or by the owner releasing its own
/// task on shutdown.
pub struct TaskLifecycle;

impl TaskLifecycle {
    pub fn allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Claimed, Pending)
                | (Running, Pending)
        )
    }

    /// Compute the record that results from applying `transition`, or reject it.
    pub fn apply(
        record: &TaskRecord,
        transition: Transition,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        let to = transition.target();
        let invalid = || DashError::InvalidTransition {
            task_id: record.task_id.clone(),
            from: record.status,
            to,
        };

        if !Self::allowed(record.status, to) {
            return Err(invalid());
        }

        let mut next = record.clone();
        match (transition, actor) {
            (Transition::Claim, Actor::Worker(worker_id)) => {
                next.worker_id = Some(worker_id.clone());
            }
            (Transition::Claim, Actor::System) => return Err(invalid()),
            (Transition::Requeue, Actor::System) => {
                next.worker_id = None;
                next.output = None;
                next.requeues += 1;
            }
            (transition, Actor::Worker(worker_id)) => {
                if !record.is_owned_by(worker_id) {
                    return Err(DashError::NotOwner {
                        task_id: record.task_id.clone(),
                        worker_id: worker_id.clone(),
                    });
                }
                match transition {
                    Transition::Complete(output) | Transition::Fail(output) => {
                        next.output = Some(output);
                    }
                    Transition::Requeue => {
                        next.worker_id = None;
                        next.output = None;
                        next.requeues += 1;
                    }
                    _ => {}
                }
            }
            (_, Actor::System) => return Err(invalid()),
        }

        next.status = to;
        next.updated_at = now;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::{TaskId, DEFAULT_LANGUAGE};

    fn worker(id: &str) -> Actor {
        Actor::Worker(SessionId::parse(id).unwrap())
    }

    fn pending() -> TaskRecord {
        TaskRecord::new(
            TaskId::parse("t1").unwrap(),
            SessionId::parse("c1").unwrap(),
            "print(1)".to_string(),
            DEFAULT_LANGUAGE.to_string(),
            Utc::now(),
        )
    }

    fn step(record: &TaskRecord, transition: Transition, actor: &Actor) -> Result<TaskRecord> {
        TaskLifecycle::apply(record, transition, actor, Utc::now())
    }

    #[test]
    fn full_happy_path() {
        let w = worker("w1");
        let claimed = step(&pending(), Transition::Claim, &w).unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.worker_id.as_ref().unwrap().as_str(), "w1");

        let running = step(&claimed, Transition::Start, &w).unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let done = step(&running, Transition::Complete("2\n".into()), &w).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("2\n"));
        assert!(done.updated_at >= done.created_at);
    }

    #[test]
    fn pending_cannot_jump_to_running() {
        let err = step(&pending(), Transition::Start, &worker("w1")).unwrap_err();
        assert!(matches!(
            err,
            DashError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        let w = worker("w1");
        let claimed = step(&pending(), Transition::Claim, &w).unwrap();
        let running = step(&claimed, Transition::Start, &w).unwrap();
        let failed = step(&running, Transition::Fail("boom".into()), &w).unwrap();

        for t in [
            Transition::Claim,
            Transition::Start,
            Transition::Complete("x".into()),
            Transition::Fail("x".into()),
        ] {
            assert!(step(&failed, t, &w).is_err());
        }
        assert!(step(&failed, Transition::Requeue, &Actor::System).is_err());
    }

    #[test]
    fn only_owner_advances() {
        let claimed = step(&pending(), Transition::Claim, &worker("w1")).unwrap();
        let err = step(&claimed, Transition::Start, &worker("w2")).unwrap_err();
        assert!(matches!(err, DashError::NotOwner { .. }));
    }

    #[test]
    fn system_only_requeues() {
        let claimed = step(&pending(), Transition::Claim, &worker("w1")).unwrap();
        assert!(step(&claimed, Transition::Start, &Actor::System).is_err());
        assert!(step(&pending(), Transition::Claim, &Actor::System).is_err());

        let requeued = step(&claimed, Transition::Requeue, &Actor::System).unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.output.is_none());
        assert_eq!(requeued.requeues, 1);
    }

    #[test]
    fn owner_may_release_but_others_may_not() {
        let claimed = step(&pending(), Transition::Claim, &worker("w1")).unwrap();
        let running = step(&claimed, Transition::Start, &worker("w1")).unwrap();

        assert!(step(&running, Transition::Requeue, &worker("w2")).is_err());
        let released = step(&running, Transition::Requeue, &worker("w1")).unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert!(released.worker_id.is_none());
    }

    #[test]
    fn pending_cannot_be_requeued() {
        assert!(step(&pending(), Transition::Requeue, &Actor::System).is_err());
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        let all = [Pending, Claimed, Running, Completed, Failed];
        let legal = [
            (Pending, Claimed),
            (Claimed, Running),
            (Running, Completed),
            (Running, Failed),
            (Claimed, Pending),
            (Running, Pending),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    TaskLifecycle::allowed(from, to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }
}
