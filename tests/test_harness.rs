//! Test harness for in-process network integration tests.
//!
//! Provides a shared in-memory store, scripted sandboxes and helpers for
//! spawning workers on their own store connections.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dash_net::presence::{PresenceRegistry, Registration};
use dash_net::store::{MemoryConnection, MemoryStore, StoreRef};
use dash_net::tasks::{TaskId, TaskRecord, TaskStatus, TaskStore};
use dash_net::worker::{ExecutionError, Sandbox, Worker};

/// Deterministic stand-in for an interpreter.
///
/// `print(1+1)` yields `"2\n"`, any code containing `raise` fails, and
/// everything else echoes the code back. With `blocking()` set, execution
/// never finishes, which lets a test kill a worker mid-task.
#[derive(Clone, Default)]
pub struct ScriptedSandbox {
    executions: Arc<AtomicUsize>,
    started: Arc<Notify>,
    delay: Option<Duration>,
    blocking: bool,
    tag: Option<String>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prefix every successful output, to tell workers apart.
    pub fn tagged(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Resolves once an execution has started.
    pub async fn started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(&self, source: &str) -> Result<String, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if self.blocking {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if source.contains("raise") {
            return Err(ExecutionError(format!(
                "Traceback (most recent call last):\nException: {}",
                source
            )));
        }
        let output = if source.trim() == "print(1+1)" {
            "2\n".to_string()
        } else {
            source.to_string()
        };
        Ok(match &self.tag {
            Some(tag) => format!("{}:{}", tag, output),
            None => output,
        })
    }
}

/// Handle to a running worker participant
pub struct TestWorker {
    pub connection: Arc<MemoryConnection>,
    pub sandbox: ScriptedSandbox,
    token: CancellationToken,
    handle: JoinHandle<dash_net::error::Result<()>>,
}

impl TestWorker {
    /// Graceful stop: releases any in-flight task and tears down presence.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    /// Abrupt stop: the process dies and its connection drops.
    pub async fn crash(self) {
        self.handle.abort();
        let _ = self.handle.await;
        self.connection.disconnect().await;
    }
}

/// One shared store with any number of participants attached.
#[derive(Clone, Default)]
pub struct TestNetwork {
    pub hub: MemoryStore,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self) -> Arc<MemoryConnection> {
        self.hub.connect().await
    }

    /// A task store on a fresh connection, for observing from the outside.
    pub async fn observer(&self) -> TaskStore {
        let store: StoreRef = self.connect().await;
        TaskStore::new(store)
    }

    pub async fn spawn_worker(&self, sandbox: ScriptedSandbox) -> TestWorker {
        self.spawn_worker_with(sandbox, Registration::worker(["python"]))
            .await
    }

    pub async fn spawn_worker_with(
        &self,
        sandbox: ScriptedSandbox,
        registration: Registration,
    ) -> TestWorker {
        let connection = self.connect().await;
        let store: StoreRef = connection.clone();
        let worker = Worker::new(
            PresenceRegistry::new(store.clone()),
            TaskStore::new(store),
            Arc::new(sandbox.clone()),
            registration,
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        TestWorker {
            connection,
            sandbox,
            token,
            handle,
        }
    }
}

/// Wait until the task reaches `status`, returning its record.
pub async fn wait_for_status(
    tasks: &TaskStore,
    task_id: &TaskId,
    status: TaskStatus,
    timeout_duration: Duration,
) -> Option<TaskRecord> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if let Ok(Some(task)) = tasks.get(task_id).await {
            if task.status == status {
                return Some(task);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
