//! Action executors
//!
//! Each [`RecoveryAction`] is bound at startup to one [`ActionExecutor`].

use crate::models::{ExecutionReport, RecoveryAction, WorkerDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs one remediation action against a worker
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, worker: &WorkerDescriptor, action: RecoveryAction) -> Result<ExecutionReport>;
}

/// Executors keyed by action
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<RecoveryAction, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: RecoveryAction, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(action, executor);
    }

    pub fn with(mut self, action: RecoveryAction, executor: Arc<dyn ActionExecutor>) -> Self {
        self.register(action, executor);
        self
    }

    pub fn get(&self, action: RecoveryAction) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(&action).cloned()
    }

    pub fn supports(&self, action: RecoveryAction) -> bool {
        self.executors.contains_key(&action)
    }

    /// Registered actions in intrusiveness order
    pub fn actions(&self) -> Vec<RecoveryAction> {
        let mut actions: Vec<RecoveryAction> = self.executors.keys().copied().collect();
        actions.sort();
        actions
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Runs an external command per action
///
/// Arguments may contain `{worker_id}`, `{action}` and `{command}`
/// placeholders. Exit status zero means success. The child is killed if the
/// call is cancelled by a timeout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line
    pub fn from_template(template: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty executor command template"))?;
        Ok(Self::new(program, parts.collect()))
    }

    fn render(&self, worker: &WorkerDescriptor, action: RecoveryAction) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{worker_id}", &worker.id)
                    .replace("{action}", action.as_str())
                    .replace("{command}", &worker.command)
            })
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, worker: &WorkerDescriptor, action: RecoveryAction) -> Result<ExecutionReport> {
        let args = self.render(worker, action);
        debug!(worker_id = %worker.id, action = %action, program = %self.program, ?args, "Running executor command");

        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn executor command '{}'", self.program))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            warn!(
                worker_id = %worker.id,
                action = %action,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Executor command failed"
            );
        }

        Ok(ExecutionReport {
            success: output.status.success(),
            duration_ms,
        })
    }
}
