use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Credentials;
use crate::presence::Role;
use crate::tasks::DEFAULT_LANGUAGE;

/// Configuration for the local execution sandbox.
///
/// Source text is written to a temporary file and passed as the last argument
/// to `interpreter`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter binary (e.g., "python3")
    pub interpreter: String,
    /// Extra arguments placed before the source file path
    pub args: Vec<String>,
    /// Kill the interpreter after this many milliseconds
    pub timeout_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            args: Vec::new(),
            timeout_ms: None,
        }
    }
}

impl SandboxConfig {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    /// Languages a worker node advertises and claims tasks for
    pub capabilities: Vec<String>,
    /// Used to tag the node's presence with an owning account
    pub credentials: Option<Credentials>,
    pub reconcile_interval_ms: u64,
    /// Requeue `running` tasks with no update for this long (off when `None`)
    pub stale_running_after_ms: Option<u64>,
    pub sandbox: SandboxConfig,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Worker,
            capabilities: vec![DEFAULT_LANGUAGE.to_string()],
            credentials: None,
            reconcile_interval_ms: 1000,
            stale_running_after_ms: None,
            sandbox: SandboxConfig::default(),
            dashboard_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn worker() -> Self {
        Self::default()
    }

    pub fn client() -> Self {
        Self {
            role: Role::Client,
            capabilities: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        if !self.capabilities.contains(&language) {
            self.capabilities.push(language);
        }
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn stale_running_after(&self) -> Option<Duration> {
        self.stale_running_after_ms.map(Duration::from_millis)
    }
}
