use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::presence::SessionId;
use crate::store::validate_key;

pub const DEFAULT_LANGUAGE: &str = "python";

/// Store-assigned, insertion-ordered task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_key(&raw, "task id")?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Owned by a worker but not finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// Persisted shape of `tasks/{taskId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub submitter_id: SessionId,
    pub code: String,
    /// Capability a worker must advertise to claim this task.
    #[serde(default = "default_language")]
    pub language: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub requeues: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        submitter_id: SessionId,
        code: String,
        language: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            submitter_id,
            code,
            language,
            status: TaskStatus::Pending,
            worker_id: None,
            output: None,
            requeues: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, session_id: &SessionId) -> bool {
        self.worker_id.as_ref() == Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::parse("0000000000000001").unwrap(),
            SessionId::parse("client-1").unwrap(),
            "print(1+1)".to_string(),
            DEFAULT_LANGUAGE.to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn new_task_is_pending_and_unowned() {
        let task = record();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());
        assert!(task.output.is_none());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn persisted_shape_uses_camel_case_and_omits_absent_fields() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["submitterId"], json!("client-1"));
        assert_eq!(value["status"], json!("pending"));
        assert!(value.get("workerId").is_none());
        assert!(value.get("output").is_none());
    }

    #[test]
    fn language_defaults_when_missing() {
        let mut value = serde_json::to_value(record()).unwrap();
        value.as_object_mut().unwrap().remove("language");
        let task: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(task.language, DEFAULT_LANGUAGE);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Claimed.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
    }
}
