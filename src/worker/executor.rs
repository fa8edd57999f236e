use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::SandboxConfig;

/// Execution failed; the message becomes the failed task's output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// Runs source text locally and captures its output.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, source: &str) -> Result<String, ExecutionError>;
}

/// Runs source text with a local interpreter process.
///
/// The source is written to a temporary file which is passed to the
/// configured interpreter. No isolation is applied beyond the process boundary.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn process_output(
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> Result<String, ExecutionError> {
        let output = result.map_err(|e| ExecutionError(format!("Failed to execute: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let message = match (stderr.is_empty(), output.status.code()) {
                (false, _) => stderr,
                (true, Some(code)) => format!("Exit code: {}", code),
                (true, None) => "Terminated by signal".to_string(),
            };
            return Err(ExecutionError(message));
        }

        let mut result = stdout;
        if !stderr.is_empty() {
            result.push_str("\nErrors:\n");
            result.push_str(&stderr);
        }
        Ok(result)
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(&self, source: &str) -> Result<String, ExecutionError> {
        let file = tempfile::NamedTempFile::new()
            .map_err(|e| ExecutionError(format!("Failed to create temp file: {}", e)))?;
        tokio::fs::write(file.path(), source)
            .await
            .map_err(|e| ExecutionError(format!("Failed to write code: {}", e)))?;

        tracing::debug!(
            interpreter = %self.config.interpreter,
            bytes = source.len(),
            "Executing source"
        );

        let child = Command::new(&self.config.interpreter)
            .args(&self.config.args)
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let result = match self.config.timeout() {
            Some(limit) => match tokio::time::timeout(limit, child).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(timeout_ms = limit.as_millis() as u64, "Execution timed out");
                    return Err(ExecutionError(format!(
                        "Execution timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => child.await,
        };

        Self::process_output(result)
    }
}
