//! Error taxonomy for supervision and recovery

use crate::models::RecoveryAction;
use thiserror::Error;

/// Errors raised by the supervision components
///
/// `ProbeUncertain` and `LockContended` are transient: callers defer to the
/// next cycle instead of surfacing them. `AttemptsExhausted` only reaches
/// operators through the escalation sink.
#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("process table unreadable for pid {pid}")]
    ProbeUncertain { pid: u32 },

    #[error("lock '{task_id}' is held by live pid {owner_pid:?}")]
    LockContended {
        task_id: String,
        owner_pid: Option<u32>,
    },

    #[error("lock '{task_id}' is held by dead pid {owner_pid}")]
    LockStale { task_id: String, owner_pid: u32 },

    #[error("action {action} timed out after {timeout_ms}ms")]
    ActionTimeout {
        action: RecoveryAction,
        timeout_ms: u64,
    },

    #[error("action {action} failed: {reason}")]
    ActionFailed {
        action: RecoveryAction,
        reason: String,
    },

    #[error("recovery attempts exhausted for worker {worker_id} after {attempts} attempts")]
    AttemptsExhausted { worker_id: String, attempts: u32 },

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("no executor registered for action {0}")]
    NoExecutor(RecoveryAction),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisionError {
    /// Transient conditions are resolved by waiting for the next poll cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupervisionError::ProbeUncertain { .. } | SupervisionError::LockContended { .. }
        )
    }

    /// Process the error is about, when it names one
    pub fn owner_pid(&self) -> Option<u32> {
        match self {
            SupervisionError::ProbeUncertain { pid } => Some(*pid),
            SupervisionError::LockContended { owner_pid, .. } => *owner_pid,
            SupervisionError::LockStale { owner_pid, .. } => Some(*owner_pid),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisionError>;
