use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};

use crate::error::{DashError, Result};
use crate::store::{
    is_under, ConnectionState, Change, Guard, Lease, SharedStore, Subscription,
};

const CHANGE_BUFFER: usize = 1024;

#[derive(Debug)]
struct ArmedLease {
    connection_id: u64,
    epoch: u64,
    path: String,
    valid: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct HubState {
    records: BTreeMap<String, Value>,
    next_key: u64,
    next_lease: u64,
    next_connection: u64,
    leases: HashMap<u64, ArmedLease>,
}

impl HubState {
    fn write(&mut self, changes: &broadcast::Sender<Change>, path: &str, value: Value) {
        self.records.insert(path.to_string(), value.clone());
        // No receivers is fine: nobody is watching yet.
        let _ = changes.send(Change::Set {
            path: path.to_string(),
            value,
        });
    }

    fn delete(&mut self, changes: &broadcast::Sender<Change>, path: &str) {
        let before = self.records.len();
        self.records
            .retain(|key, _| !is_under(key, path));
        if self.records.len() != before {
            let _ = changes.send(Change::Removed {
                path: path.to_string(),
            });
        }
    }
}

#[derive(Debug)]
struct Hub {
    state: Mutex<HubState>,
    changes: broadcast::Sender<Change>,
    live_queries: Arc<AtomicUsize>,
}

/// In-memory store server shared by every participant of a process.
///
/// Participants never use the hub directly; each one gets its own
/// [`MemoryConnection`] through [`MemoryStore::connect`], which carries the
/// connection state and the leases armed on it.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    hub: Arc<Hub>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState::default()),
                changes,
                live_queries: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Open a new participant connection, already connected.
    pub async fn connect(&self) -> Arc<MemoryConnection> {
        let id = {
            let mut state = self.hub.state.lock().await;
            state.next_connection += 1;
            state.next_connection
        };
        let (state, _) = watch::channel(ConnectionState::Connected);
        tracing::debug!(connection_id = id, "Store connection opened");
        Arc::new(MemoryConnection {
            id,
            hub: self.hub.clone(),
            state,
            epoch: AtomicU64::new(1),
        })
    }

    /// Read a record regardless of any connection's state.
    pub async fn peek(&self, path: &str) -> Option<Value> {
        self.hub.state.lock().await.records.get(path).cloned()
    }

    /// Number of keys currently stored below `prefix`.
    pub async fn count_under(&self, prefix: &str) -> usize {
        self.hub
            .state
            .lock()
            .await
            .records
            .keys()
            .filter(|k| is_under(k, prefix) && k.as_str() != prefix)
            .count()
    }

    /// Subscriptions that are neither cancelled nor dropped.
    pub fn live_subscriptions(&self) -> usize {
        self.hub.live_queries.load(Ordering::SeqCst)
    }

    /// Leases currently armed across all connections.
    pub async fn armed_leases(&self) -> usize {
        self.hub.state.lock().await.leases.len()
    }
}

/// One participant's session with a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    hub: Arc<Hub>,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current connection epoch; bumped by every reconnect.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Drop the connection abruptly, as a crash or network loss would.
    ///
    /// The server applies every lease armed during the current epoch.
    pub async fn disconnect(&self) {
        if *self.state.borrow() == ConnectionState::Disconnected {
            return;
        }
        let epoch = self.epoch();
        self.state.send_replace(ConnectionState::Disconnected);

        let mut state = self.hub.state.lock().await;
        let expired: Vec<u64> = state
            .leases
            .iter()
            .filter(|(_, l)| l.connection_id == self.id && l.epoch == epoch)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            if let Some(lease) = state.leases.remove(&lease_id) {
                state.delete(&self.hub.changes, &lease.path);
                lease.valid.send_replace(false);
                tracing::debug!(
                    connection_id = self.id,
                    lease_id,
                    path = %lease.path,
                    "Lease fired on disconnect"
                );
            }
        }
    }

    /// Re-establish the connection. Starts a new epoch with no leases armed.
    pub fn reconnect(&self) {
        if *self.state.borrow() == ConnectionState::Connected {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        tracing::debug!(connection_id = self.id, epoch = self.epoch(), "Store reconnected");
    }

    fn ensure_connected(&self) -> Result<()> {
        if *self.state.borrow() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(DashError::StoreUnavailable)
        }
    }

    /// Take the hub lock for a write, failing if the connection dropped or
    /// cycled while waiting for it.
    ///
    /// `disconnect` flips the state before it takes the lock to purge leases,
    /// so a write that sees `Connected` here lands before that purge.
    async fn lock_for_write(&self) -> Result<(MutexGuard<'_, HubState>, u64)> {
        self.ensure_connected()?;
        let epoch = self.epoch();
        let state = self.hub.state.lock().await;
        if *self.state.borrow() != ConnectionState::Connected || self.epoch() != epoch {
            tracing::debug!(connection_id = self.id, epoch, "Write dropped by disconnect");
            return Err(DashError::StoreUnavailable);
        }
        Ok((state, epoch))
    }
}

#[async_trait]
impl SharedStore for MemoryConnection {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.ensure_connected()?;
        Ok(self.hub.state.lock().await.records.get(path).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        self.ensure_connected()?;
        let state = self.hub.state.lock().await;
        let prefix = format!("{}/", collection);
        Ok(state
            .records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let key = &k[prefix.len()..];
                (!key.contains('/')).then(|| (key.to_string(), v.clone()))
            })
            .collect())
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let (mut state, _) = self.lock_for_write().await?;
        state.write(&self.hub.changes, path, value);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let (mut state, _) = self.lock_for_write().await?;
        state.delete(&self.hub.changes, path);
        Ok(())
    }

    async fn push_key(&self, collection: &str) -> Result<String> {
        let (mut state, _) = self.lock_for_write().await?;
        state.next_key += 1;
        let key = format!("{:016x}", state.next_key);
        tracing::trace!(collection, key = %key, "Allocated key");
        Ok(key)
    }

    async fn compare_and_set(&self, path: &str, guard: &Guard, value: Value) -> Result<bool> {
        let (mut state, _) = self.lock_for_write().await?;
        if !guard.matches(state.records.get(path)) {
            return Ok(false);
        }
        state.write(&self.hub.changes, path, value);
        Ok(true)
    }

    fn subscribe(&self, prefix: &str) -> Subscription {
        Subscription::new(
            prefix,
            self.hub.changes.subscribe(),
            self.state.subscribe(),
            self.hub.live_queries.clone(),
        )
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn arm_lease(&self, path: &str) -> Result<Lease> {
        let (mut state, epoch) = self.lock_for_write().await?;
        state.next_lease += 1;
        let id = state.next_lease;
        let (valid, valid_rx) = watch::channel(true);
        state.leases.insert(
            id,
            ArmedLease {
                connection_id: self.id,
                epoch,
                path: path.to_string(),
                valid,
            },
        );
        Ok(Lease::new(id, path.to_string(), epoch, valid_rx))
    }

    async fn cancel_lease(&self, lease: &Lease) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.hub.state.lock().await;
        if let Some(armed) = state.leases.remove(&lease.id()) {
            armed.valid.send_replace(false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn push_keys_are_insertion_ordered() {
        let store = MemoryStore::new();
        let conn = store.connect().await;

        let a = conn.push_key("tasks").await.unwrap();
        let b = conn.push_key("tasks").await.unwrap();
        let c = conn.push_key("tasks").await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let store = MemoryStore::new();
        let conn = store.connect().await;

        conn.set("tasks/a", json!({"n": 1})).await.unwrap();
        conn.set("tasks/b", json!({"n": 2})).await.unwrap();
        conn.set("presence/a", json!({"n": 3})).await.unwrap();

        let tasks = conn.list("tasks").await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].0, "a");
        assert_eq!(tasks[1].1, json!({"n": 2}));
    }

    #[tokio::test]
    async fn compare_and_set_accepts_only_matching_guard() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        conn.set("tasks/t", json!({"status": "pending"})).await.unwrap();

        let guard = Guard::field("status", "pending");
        assert!(conn
            .compare_and_set("tasks/t", &guard, json!({"status": "claimed"}))
            .await
            .unwrap());
        assert!(!conn
            .compare_and_set("tasks/t", &guard, json!({"status": "claimed"}))
            .await
            .unwrap());
        assert!(!conn
            .compare_and_set("tasks/missing", &guard, json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn writes_fail_while_disconnected() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        conn.disconnect().await;

        let err = conn.set("tasks/t", json!({})).await.unwrap_err();
        assert!(matches!(err, DashError::StoreUnavailable));
        assert!(!conn.is_connected());

        conn.reconnect();
        conn.set("tasks/t", json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn lease_fires_once_for_its_epoch() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        conn.set("presence/s1", json!({"role": "worker"})).await.unwrap();
        let mut lease = conn.arm_lease("presence/s1").await.unwrap();
        assert!(lease.is_valid());

        conn.disconnect().await;
        lease.invalidated().await;
        assert!(!lease.is_valid());
        assert!(store.peek("presence/s1").await.is_none());
        assert_eq!(store.armed_leases().await, 0);

        // A new epoch does not inherit the old lease.
        conn.reconnect();
        conn.set("presence/s1", json!({"role": "worker"})).await.unwrap();
        conn.disconnect().await;
        assert!(store.peek("presence/s1").await.is_some());
    }

    #[tokio::test]
    async fn lease_queued_behind_disconnect_is_refused() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        conn.set("presence/s1", json!({})).await.unwrap();

        let held = store.hub.state.lock().await;
        let arming = tokio::spawn({
            let conn = conn.clone();
            async move { conn.arm_lease("presence/s1").await }
        });
        // Let the arm pass its first check and queue on the lock.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        conn.state.send_replace(ConnectionState::Disconnected);
        drop(held);

        let err = arming.await.unwrap().unwrap_err();
        assert!(matches!(err, DashError::StoreUnavailable));
        assert_eq!(store.armed_leases().await, 0);
    }

    #[tokio::test]
    async fn write_queued_across_reconnect_is_refused() {
        let store = MemoryStore::new();
        let conn = store.connect().await;

        let held = store.hub.state.lock().await;
        let writing = tokio::spawn({
            let conn = conn.clone();
            async move { conn.set("tasks/t", json!({"n": 1})).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        conn.state.send_replace(ConnectionState::Disconnected);
        conn.reconnect();
        drop(held);

        let err = writing.await.unwrap().unwrap_err();
        assert!(matches!(err, DashError::StoreUnavailable));
        assert!(store.peek("tasks/t").await.is_none());
        conn.set("tasks/t", json!({"n": 2})).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_lease_does_not_fire() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        conn.set("presence/s1", json!({})).await.unwrap();
        let lease = conn.arm_lease("presence/s1").await.unwrap();
        conn.cancel_lease(&lease).await.unwrap();

        conn.disconnect().await;
        assert!(store.peek("presence/s1").await.is_some());
    }

    #[tokio::test]
    async fn leases_are_scoped_to_their_connection() {
        let store = MemoryStore::new();
        let a = store.connect().await;
        let b = store.connect().await;
        a.set("presence/a", json!({})).await.unwrap();
        b.set("presence/b", json!({})).await.unwrap();
        a.arm_lease("presence/a").await.unwrap();
        b.arm_lease("presence/b").await.unwrap();

        a.disconnect().await;
        assert!(store.peek("presence/a").await.is_none());
        assert!(store.peek("presence/b").await.is_some());
    }

    #[tokio::test]
    async fn subscription_filters_by_prefix() {
        let store = MemoryStore::new();
        let conn = store.connect().await;
        let mut sub = conn.subscribe("tasks/t1");

        conn.set("tasks/t2", json!({"n": 2})).await.unwrap();
        conn.set("tasks/t1", json!({"n": 1})).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            change,
            Change::Set {
                path: "tasks/t1".to_string(),
                value: json!({"n": 1})
            }
        );
    }

    #[tokio::test]
    async fn subscription_count_tracks_cancel_and_drop() {
        let store = MemoryStore::new();
        let conn = store.connect().await;

        let mut first = conn.subscribe("tasks");
        let second = conn.subscribe("presence");
        assert_eq!(store.live_subscriptions(), 2);

        first.cancel();
        assert_eq!(store.live_subscriptions(), 1);
        assert!(first.next().await.is_none());

        drop(second);
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn subscription_resyncs_after_reconnect() {
        let store = MemoryStore::new();
        let watcher = store.connect().await;
        let writer = store.connect().await;
        let mut sub = watcher.subscribe("tasks");

        watcher.disconnect().await;
        writer.set("tasks/t1", json!({"n": 1})).await.unwrap();

        let stalled = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(stalled.is_err(), "delivery should stall while offline");

        watcher.reconnect();
        let change = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert_eq!(change, Some(Change::Resync));
    }
}
