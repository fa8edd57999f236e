//! Liveness and status of every connected participant.
//!
//! Each participant owns one record under `presence/{sessionId}`. Liveness is
//! not derived from heartbeats: the record is removed by the store itself when
//! the session's connection drops (see [`crate::store::Lease`]), so "has a
//! presence record" is the authoritative definition of "alive".

pub mod registry;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DashError, Result};
use crate::identity::AccountId;
use crate::store::validate_key;

pub use registry::{PresenceRegistry, PresenceSnapshot, PresenceWatch, Registration};

/// Session-scoped participant identifier, generated at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_key(&raw, "session id")?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Offline,
}

/// Any status a participant can report, across roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Idle => write!(f, "idle"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

impl From<WorkerStatus> for NodeStatus {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Idle => NodeStatus::Idle,
            WorkerStatus::Busy => NodeStatus::Busy,
            WorkerStatus::Offline => NodeStatus::Offline,
        }
    }
}

impl From<ClientStatus> for NodeStatus {
    fn from(status: ClientStatus) -> Self {
        match status {
            ClientStatus::Online => NodeStatus::Online,
            ClientStatus::Offline => NodeStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresence {
    pub status: ClientStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPresence {
    pub status: WorkerStatus,
    pub last_seen: DateTime<Utc>,
    /// Language tags this worker can execute.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
}

/// Persisted shape of `presence/{sessionId}`, discriminated by `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum PresenceRecord {
    Client(ClientPresence),
    Worker(WorkerPresence),
}

impl PresenceRecord {
    pub fn role(&self) -> Role {
        match self {
            PresenceRecord::Client(_) => Role::Client,
            PresenceRecord::Worker(_) => Role::Worker,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            PresenceRecord::Client(c) => c.status.into(),
            PresenceRecord::Worker(w) => w.status.into(),
        }
    }

    /// Advisory only; liveness comes from the record's existence.
    pub fn last_seen(&self) -> DateTime<Utc> {
        match self {
            PresenceRecord::Client(c) => c.last_seen,
            PresenceRecord::Worker(w) => w.last_seen,
        }
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        match self {
            PresenceRecord::Client(c) => c.account_id.as_ref(),
            PresenceRecord::Worker(w) => w.account_id.as_ref(),
        }
    }

    pub fn capabilities(&self) -> Option<&BTreeSet<String>> {
        match self {
            PresenceRecord::Client(_) => None,
            PresenceRecord::Worker(w) => Some(&w.capabilities),
        }
    }

    /// Apply a status change, rejecting statuses the role does not have.
    pub fn with_status(&self, status: NodeStatus, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.clone();
        match &mut next {
            PresenceRecord::Client(c) => {
                c.status = match status {
                    NodeStatus::Online => ClientStatus::Online,
                    NodeStatus::Offline => ClientStatus::Offline,
                    other => {
                        return Err(DashError::InvalidInput(format!(
                            "client presence cannot be {}",
                            other
                        )))
                    }
                };
                c.last_seen = now;
            }
            PresenceRecord::Worker(w) => {
                w.status = match status {
                    NodeStatus::Idle => WorkerStatus::Idle,
                    NodeStatus::Busy => WorkerStatus::Busy,
                    NodeStatus::Offline => WorkerStatus::Offline,
                    other => {
                        return Err(DashError::InvalidInput(format!(
                            "worker presence cannot be {}",
                            other
                        )))
                    }
                };
                w.last_seen = now;
            }
        }
        Ok(next)
    }

    pub fn touched(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        match &mut next {
            PresenceRecord::Client(c) => c.last_seen = now,
            PresenceRecord::Worker(w) => w.last_seen = now,
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker() -> PresenceRecord {
        PresenceRecord::Worker(WorkerPresence {
            status: WorkerStatus::Idle,
            last_seen: Utc::now(),
            capabilities: ["python".to_string()].into_iter().collect(),
            account_id: None,
        })
    }

    #[test]
    fn worker_record_serializes_with_role_tag() {
        let value = serde_json::to_value(worker()).unwrap();
        assert_eq!(value["role"], json!("worker"));
        assert_eq!(value["status"], json!("idle"));
        assert_eq!(value["capabilities"], json!(["python"]));
        assert!(value.get("accountId").is_none());
    }

    #[test]
    fn client_record_roundtrips() {
        let record = PresenceRecord::Client(ClientPresence {
            status: ClientStatus::Online,
            last_seen: Utc::now(),
            account_id: Some(AccountId::new("acct")),
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["role"], json!("client"));
        assert_eq!(value["accountId"], json!("acct"));
        let back: PresenceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn status_must_fit_role() {
        let now = Utc::now();
        let busy = worker().with_status(NodeStatus::Busy, now).unwrap();
        assert_eq!(busy.status(), NodeStatus::Busy);
        assert!(worker().with_status(NodeStatus::Online, now).is_err());

        let client = PresenceRecord::Client(ClientPresence {
            status: ClientStatus::Online,
            last_seen: now,
            account_id: None,
        });
        assert!(client.with_status(NodeStatus::Busy, now).is_err());
        assert_eq!(
            client.with_status(NodeStatus::Offline, now).unwrap().status(),
            NodeStatus::Offline
        );
    }

    #[test]
    fn session_id_rejects_path_characters() {
        assert!(SessionId::parse("abc").is_ok());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("").is_err());
    }
}
