//! Access contract for the shared realtime store.
//!
//! Every participant (client or worker) talks to the network through one
//! connection to a shared, subscribable tree of JSON records. The coordination
//! layer only needs a small capability set from that store:
//!
//! - keyed reads and unconditional writes
//! - a conditional write ([`SharedStore::compare_and_set`]) guarded on one or
//!   more fields of the current record
//! - change subscriptions on a key or key prefix ([`Subscription`])
//! - the connection state as observed by the store server
//! - a connection-scoped cleanup write ([`Lease`]) that the server applies when
//!   the session drops
//!
//! [`memory::MemoryStore`] implements the contract in memory and backs both the
//! test suite and the single-process `network` mode of the binary.

pub mod memory;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};

pub use memory::{MemoryConnection, MemoryStore};

/// Collection holding one record per connected participant.
pub const PRESENCE: &str = "presence";
/// Collection holding task records.
pub const TASKS: &str = "tasks";

pub type StoreRef = Arc<dyn SharedStore>;

/// Build the path of a record inside a collection.
pub fn record_path(collection: &str, key: &str) -> String {
    format!("{}/{}", collection, key)
}

/// Returns true if `path` is `prefix` itself or lives below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Check a store-assigned or caller-supplied key before it is used in a path.
pub fn validate_key(key: &str, what: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DashError::InvalidInput(format!("{} must not be empty", what)));
    }
    if key.len() > 768 {
        return Err(DashError::InvalidInput(format!("{} is too long", what)));
    }
    if let Some(c) = key
        .chars()
        .find(|c| matches!(c, '/' | '.' | '#' | '$' | '[' | ']') || c.is_control())
    {
        return Err(DashError::InvalidInput(format!(
            "{} contains illegal character {:?}",
            what, c
        )));
    }
    Ok(())
}

/// Connection state as observed by the store server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A conjunction of `field == expected` checks evaluated atomically with a write.
///
/// A missing field compares equal to `null`, so `Guard::field("workerId", Value::Null)`
/// matches a record with no owner. A missing record never matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guard {
    conditions: Vec<(String, Value)>,
}

impl Guard {
    pub fn field(name: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self::default().and(name, expected)
    }

    pub fn and(mut self, name: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.conditions.push((name.into(), expected.into()));
        self
    }

    pub fn matches(&self, current: Option<&Value>) -> bool {
        let Some(current) = current else {
            return false;
        };
        self.conditions.iter().all(|(name, expected)| {
            current.get(name.as_str()).unwrap_or(&Value::Null) == expected
        })
    }
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set { path: String, value: Value },
    Removed { path: String },
    /// Notifications were dropped (slow consumer or reconnect); re-read the watched data.
    Resync,
}

impl Change {
    pub fn path(&self) -> Option<&str> {
        match self {
            Change::Set { path, .. } | Change::Removed { path } => Some(path),
            Change::Resync => None,
        }
    }
}

/// Server-side cleanup armed for one connection epoch.
///
/// When the epoch ends (the connection drops) the server removes the leased
/// path and the lease becomes invalid. A lease never outlives its epoch, so it
/// has to be armed again after every reconnect.
#[derive(Debug, Clone)]
pub struct Lease {
    id: u64,
    path: String,
    epoch: u64,
    valid: watch::Receiver<bool>,
}

impl Lease {
    pub fn new(id: u64, path: String, epoch: u64, valid: watch::Receiver<bool>) -> Self {
        Self {
            id,
            path,
            epoch,
            valid,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_valid(&self) -> bool {
        *self.valid.borrow()
    }

    /// Resolves once the store has invalidated this lease.
    pub async fn invalidated(&mut self) {
        while *self.valid.borrow_and_update() {
            if self.valid.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Decrements the live subscription counter of a store when released.
#[derive(Debug)]
struct LiveQuery(Arc<AtomicUsize>);

impl LiveQuery {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A cancellable stream of changes below one path prefix.
///
/// Delivery stalls while the owning connection is offline; after a reconnect
/// the next item is [`Change::Resync`]. Cancelling (through [`Self::cancel`] or
/// any clone of its token) or dropping the subscription releases the live query.
#[derive(Debug)]
pub struct Subscription {
    prefix: String,
    changes: broadcast::Receiver<Change>,
    connection: watch::Receiver<ConnectionState>,
    token: CancellationToken,
    live: Option<LiveQuery>,
    stalled: bool,
}

impl Subscription {
    pub fn new(
        prefix: impl Into<String>,
        changes: broadcast::Receiver<Change>,
        connection: watch::Receiver<ConnectionState>,
        live_counter: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            changes,
            connection,
            token: CancellationToken::new(),
            live: Some(LiveQuery::acquire(live_counter)),
            stalled: false,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&mut self) {
        self.token.cancel();
        self.live.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the next change below the prefix. Returns `None` once cancelled.
    pub async fn next(&mut self) -> Option<Change> {
        loop {
            if self.token.is_cancelled() {
                self.live.take();
                return None;
            }

            let state = *self.connection.borrow_and_update();
            match state {
                ConnectionState::Disconnected => {
                    self.stalled = true;
                    tokio::select! {
                        _ = self.token.cancelled() => {}
                        changed = self.connection.changed() => {
                            if changed.is_err() {
                                self.live.take();
                                return None;
                            }
                        }
                    }
                    continue;
                }
                ConnectionState::Connected if self.stalled => {
                    self.stalled = false;
                    // Drop whatever was buffered while offline.
                    self.changes = self.changes.resubscribe();
                    return Some(Change::Resync);
                }
                ConnectionState::Connected => {}
            }

            tokio::select! {
                _ = self.token.cancelled() => continue,
                changed = self.connection.changed() => {
                    if changed.is_err() {
                        self.live.take();
                        return None;
                    }
                }
                received = self.changes.recv() => match received {
                    Ok(change) => {
                        if change.path().is_some_and(|p| is_under(p, &self.prefix)) {
                            return Some(change);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(prefix = %self.prefix, skipped, "Subscription lagged");
                        return Some(Change::Resync);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.live.take();
                        return None;
                    }
                }
            }
        }
    }
}

/// The minimum capability set the coordination layer requires from the store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read one record.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Read every record of a collection as `(key, value)`, ordered by key.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;

    /// Unconditional, last-writer-wins overwrite.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Allocate a store-assigned key that sorts after every key allocated before it.
    async fn push_key(&self, collection: &str) -> Result<String>;

    /// Replace the record at `path` with `value` only if the current record
    /// satisfies `guard`. Returns whether the write was accepted.
    async fn compare_and_set(&self, path: &str, guard: &Guard, value: Value) -> Result<bool>;

    fn subscribe(&self, prefix: &str) -> Subscription;

    fn connection(&self) -> watch::Receiver<ConnectionState>;

    /// Arm a server-side removal of `path` for when the current connection drops.
    async fn arm_lease(&self, path: &str) -> Result<Lease>;

    async fn cancel_lease(&self, lease: &Lease) -> Result<()>;

    fn is_connected(&self) -> bool {
        *self.connection().borrow() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn is_under_matches_prefix_boundaries() {
        assert!(is_under("tasks/abc", "tasks"));
        assert!(is_under("tasks", "tasks"));
        assert!(is_under("tasks/abc", "tasks/abc"));
        assert!(!is_under("tasks2/abc", "tasks"));
        assert!(!is_under("tasks/abcd", "tasks/abc"));
        assert!(!is_under("presence/x", "tasks"));
    }

    #[test]
    fn guard_requires_every_condition() {
        let record = json!({"status": "claimed", "workerId": "w1"});
        let guard = Guard::field("status", "claimed").and("workerId", "w1");
        assert!(guard.matches(Some(&record)));

        let other = Guard::field("status", "claimed").and("workerId", "w2");
        assert!(!other.matches(Some(&record)));
    }

    #[test]
    fn guard_treats_missing_field_as_null() {
        let record = json!({"status": "pending"});
        assert!(Guard::field("workerId", Value::Null).matches(Some(&record)));
        assert!(!Guard::field("workerId", "w1").matches(Some(&record)));
    }

    #[test]
    fn guard_never_matches_missing_record() {
        assert!(!Guard::field("status", "pending").matches(None));
        assert!(!Guard::default().matches(None));
    }

    #[test]
    fn validate_key_rejects_malformed_keys() {
        assert!(validate_key("000000000000002a", "task id").is_ok());
        assert!(validate_key("", "task id").is_err());
        assert!(validate_key("a/b", "task id").is_err());
        assert!(validate_key("a.b", "task id").is_err());
        assert!(validate_key("a[0]", "task id").is_err());
        assert!(validate_key(&"x".repeat(769), "task id").is_err());
    }

    #[test]
    fn record_path_joins_collection_and_key() {
        assert_eq!(record_path(TASKS, "0001"), "tasks/0001");
        assert_eq!(record_path(PRESENCE, "s1"), "presence/s1");
    }
}
