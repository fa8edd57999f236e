use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::identity::{AccountId, IdentityProvider};
use crate::presence::{PresenceRegistry, Registration, Role};
use crate::store::StoreRef;
use crate::tasks::{Reconciler, TaskStore};
use crate::worker::{ProcessSandbox, Sandbox, Worker};

/// One participant process: its store connection plus every loop it runs.
pub struct Node {
    pub config: NodeConfig,
    store: StoreRef,
    sandbox: Arc<dyn Sandbox>,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl Node {
    pub fn new(config: NodeConfig, store: StoreRef) -> Self {
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox.clone()));
        Self {
            config,
            store,
            sandbox,
            identity: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    async fn account(&self) -> Result<Option<AccountId>> {
        match (&self.identity, &self.config.credentials) {
            (Some(identity), Some(credentials)) => {
                let account = identity.authenticate(credentials).await?;
                tracing::info!(account_id = %account, "Node authenticated");
                Ok(Some(account))
            }
            _ => Ok(None),
        }
    }

    /// Run the node until `token` is cancelled.
    ///
    /// 1. Resolves the owning account, if credentials and an identity provider are set
    /// 2. Spawns the reconciler (every node runs one; requeues are compare-and-set)
    /// 3. Spawns the dashboard with its own client session, if configured
    /// 4. Runs the worker loop (worker role) or waits for shutdown (client role)
    ///
    /// # Errors
    ///
    /// Returns an error if authentication or the initial presence registration
    /// fails. Spawned loops log their own errors.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let account = self.account().await?;
        let registry = PresenceRegistry::new(self.store.clone());
        let tasks = TaskStore::new(self.store.clone());

        let mut reconciler = Reconciler::new(tasks.clone(), registry.clone());
        if let Some(after) = self.config.stale_running_after() {
            reconciler = reconciler.with_stale_running_after(after);
        }
        let reconcile_handle = tokio::spawn(
            reconciler.run(self.config.reconcile_interval(), token.child_token()),
        );

        let mut dashboard_client = None;
        if let Some(addr) = self.config.dashboard_addr {
            let client = Arc::new(
                Client::connect_as(self.store.clone(), self.sandbox.clone(), account.clone())
                    .await?,
            );
            client.keep_alive(token.child_token());
            let state = DashboardState::new(client.clone());
            let dashboard_token = token.child_token();
            tokio::spawn(async move {
                run_dashboard(addr, state, dashboard_token).await;
            });
            dashboard_client = Some(client);
        }

        match self.config.role {
            Role::Worker => {
                let mut registration = Registration::worker(self.config.capabilities.clone());
                if let Some(account) = account {
                    registration = registration.with_account(account);
                }
                let worker = Worker::new(registry, tasks, self.sandbox.clone(), registration);
                worker.run(token.clone()).await?;
            }
            Role::Client => token.cancelled().await,
        }

        token.cancel();
        let _ = reconcile_handle.await;
        if let Some(client) = dashboard_client {
            if let Err(e) = client.registry().teardown(client.session_id()).await {
                tracing::debug!(error = %e, "Dashboard session teardown failed");
            }
        }
        Ok(())
    }
}
