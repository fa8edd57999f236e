use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{DashError, Result};
use crate::identity::AccountId;
use crate::presence::{
    ClientPresence, ClientStatus, NodeStatus, PresenceRecord, Role, SessionId, WorkerPresence,
    WorkerStatus,
};
use crate::store::{record_path, ConnectionState, Lease, StoreRef, Subscription, PRESENCE};

/// What a participant announces about itself when it registers.
#[derive(Debug, Clone)]
pub struct Registration {
    pub role: Role,
    pub capabilities: BTreeSet<String>,
    pub account_id: Option<AccountId>,
}

impl Registration {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            capabilities: BTreeSet::new(),
            account_id: None,
        }
    }

    pub fn worker<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: Role::Worker,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            account_id: None,
        }
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    fn into_record(self) -> PresenceRecord {
        let now = Utc::now();
        match self.role {
            Role::Client => PresenceRecord::Client(ClientPresence {
                status: ClientStatus::Online,
                last_seen: now,
                account_id: self.account_id,
            }),
            Role::Worker => PresenceRecord::Worker(WorkerPresence {
                status: WorkerStatus::Idle,
                last_seen: now,
                capabilities: self.capabilities,
                account_id: self.account_id,
            }),
        }
    }
}

impl From<Role> for Registration {
    fn from(role: Role) -> Self {
        match role {
            Role::Client => Registration::client(),
            Role::Worker => Registration::worker(Vec::<String>::new()),
        }
    }
}

/// A session registered through this registry.
#[derive(Debug)]
struct LocalSession {
    record: PresenceRecord,
    lease: Option<Lease>,
}

impl LocalSession {
    fn needs_lease(&self) -> bool {
        self.lease.as_ref().map_or(true, |l| !l.is_valid())
    }
}

/// One registry snapshot: every live participant, optionally filtered by role.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSnapshot {
    pub count: usize,
    pub records: Vec<(SessionId, PresenceRecord)>,
}

/// Registers this process's sessions and reads everyone else's.
///
/// Registration arms a [`Lease`] so the store removes the record when the
/// connection drops. Leases do not survive a reconnect: [`Self::rearm`] (driven
/// by [`Self::maintain`]) arms a fresh one and re-asserts the record for every
/// local session whose lease was invalidated.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: StoreRef,
    sessions: Arc<RwLock<HashMap<SessionId, LocalSession>>>,
}

impl PresenceRegistry {
    pub fn new(store: StoreRef) -> Self {
        Self {
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, role: Role) -> Result<SessionId> {
        self.register_with(role.into()).await
    }

    pub async fn register_with(&self, registration: Registration) -> Result<SessionId> {
        let key = self.store.push_key(PRESENCE).await?;
        let session_id = SessionId::parse(key)?;
        let record = registration.into_record();
        let path = record_path(PRESENCE, session_id.as_str());

        // Arm cleanup before the record becomes visible.
        let lease = self.store.arm_lease(&path).await?;
        if let Err(e) = self.store.set(&path, serde_json::to_value(&record)?).await {
            let _ = self.store.cancel_lease(&lease).await;
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            role = %record.role(),
            status = %record.status(),
            "Session registered"
        );

        self.sessions.write().await.insert(
            session_id.clone(),
            LocalSession {
                record,
                lease: Some(lease),
            },
        );
        Ok(session_id)
    }

    /// Overwrite the status of a local session (last writer wins).
    pub async fn set_status(&self, session_id: &SessionId, status: NodeStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| DashError::SessionNotFound(session_id.clone()))?;

        let next = session.record.with_status(status, Utc::now())?;
        self.store
            .set(
                &record_path(PRESENCE, session_id.as_str()),
                serde_json::to_value(&next)?,
            )
            .await?;
        session.record = next;

        tracing::debug!(session_id = %session_id, status = %status, "Presence status updated");
        Ok(())
    }

    /// Status of a local session as this participant should display it:
    /// `offline` whenever the store connection is down.
    pub async fn local_status(&self, session_id: &SessionId) -> Option<NodeStatus> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id)?;
        if self.store.is_connected() {
            Some(session.record.status())
        } else {
            Some(NodeStatus::Offline)
        }
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectionState> {
        self.store.connection()
    }

    /// Live stream of registry snapshots, starting with the current one.
    pub fn watch_all(&self, role: Option<Role>) -> PresenceWatch {
        PresenceWatch {
            store: self.store.clone(),
            subscription: self.store.subscribe(PRESENCE),
            role,
            primed: false,
        }
    }

    pub async fn snapshot(&self, role: Option<Role>) -> Result<PresenceSnapshot> {
        read_snapshot(&self.store, role).await
    }

    /// Session ids that currently have a presence record.
    pub async fn live_sessions(&self) -> Result<HashSet<SessionId>> {
        let entries = self.store.list(PRESENCE).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| SessionId::parse(key).ok())
            .collect())
    }

    /// Best-effort removal on graceful shutdown. The lease remains the
    /// fallback when this is never reached.
    pub async fn teardown(&self, session_id: &SessionId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| DashError::SessionNotFound(session_id.clone()))?;

        if let Some(lease) = session.lease.as_ref().filter(|l| l.is_valid()) {
            self.store.cancel_lease(lease).await?;
        }
        self.store
            .remove(&record_path(PRESENCE, session_id.as_str()))
            .await?;

        tracing::info!(session_id = %session_id, "Session torn down");
        Ok(())
    }

    /// Arm a fresh lease and re-assert the record of every local session whose
    /// lease is gone. Returns the number of sessions re-armed.
    pub async fn rearm(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let mut rearmed = 0;

        for (session_id, session) in sessions.iter_mut() {
            if !session.needs_lease() {
                continue;
            }
            let path = record_path(PRESENCE, session_id.as_str());
            let lease = self.store.arm_lease(&path).await?;
            let record = session.record.touched(Utc::now());
            if let Err(e) = self.store.set(&path, serde_json::to_value(&record)?).await {
                let _ = self.store.cancel_lease(&lease).await;
                return Err(e);
            }
            session.record = record;
            session.lease = Some(lease);
            rearmed += 1;

            tracing::info!(session_id = %session_id, "Presence lease re-armed");
        }

        Ok(rearmed)
    }

    /// Follow the connection state until cancelled, re-arming after every reconnect.
    pub async fn maintain(self, token: CancellationToken) {
        let mut connection = self.store.connection();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    match state {
                        ConnectionState::Connected => match self.rearm().await {
                            Ok(n) => tracing::info!(rearmed = n, "Store connection restored"),
                            // Another flap; the next Connected edge retries.
                            Err(e) => tracing::warn!(error = %e, "Failed to re-arm presence"),
                        },
                        ConnectionState::Disconnected => {
                            tracing::warn!("Store connection lost, local presence is offline");
                        }
                    }
                }
            }
        }
    }
}

async fn read_snapshot(store: &StoreRef, role: Option<Role>) -> Result<PresenceSnapshot> {
    let entries = store.list(PRESENCE).await?;
    let mut records = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let Ok(session_id) = SessionId::parse(key) else {
            continue;
        };
        match serde_json::from_value::<PresenceRecord>(value) {
            Ok(record) => {
                if role.map_or(true, |r| record.role() == r) {
                    records.push((session_id, record));
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed presence record");
            }
        }
    }
    Ok(PresenceSnapshot {
        count: records.len(),
        records,
    })
}

/// Unbounded stream of [`PresenceSnapshot`]s. Dropping or cancelling it
/// releases the underlying subscription.
pub struct PresenceWatch {
    store: StoreRef,
    subscription: Subscription,
    role: Option<Role>,
    primed: bool,
}

impl PresenceWatch {
    pub fn cancel(&mut self) {
        self.subscription.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.subscription.cancellation_token()
    }

    pub async fn next(&mut self) -> Option<PresenceSnapshot> {
        if !self.primed {
            self.primed = true;
            if let Ok(snapshot) = read_snapshot(&self.store, self.role).await {
                return Some(snapshot);
            }
        }
        loop {
            self.subscription.next().await?;
            match read_snapshot(&self.store, self.role).await {
                Ok(snapshot) => return Some(snapshot),
                // Stalled until the connection comes back.
                Err(DashError::StoreUnavailable) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read presence snapshot");
                    continue;
                }
            }
        }
    }
}
