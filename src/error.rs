use thiserror::Error;

use crate::presence::SessionId;
use crate::tasks::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum DashError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Session {worker_id} does not own task {task_id}")]
    NotOwner {
        task_id: TaskId,
        worker_id: SessionId,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Store unavailable: connection is offline")]
    StoreUnavailable,

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DashError {
    /// True for errors caused by the caller rather than by store state or connectivity.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DashError::InvalidInput(_)
                | DashError::InvalidTransition { .. }
                | DashError::NotOwner { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DashError>;
