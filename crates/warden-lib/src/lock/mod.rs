//! Distributed task locks
//!
//! At-most-one-concurrent-execution per task key. The file backend publishes
//! lock records with an exclusive create-only operation and reclaims locks
//! whose owner process has died. The [`TaskLock`] trait keeps the contract
//! substitutable by a lease-based store for multi-host deployments.

mod file;

#[cfg(test)]
mod tests;

pub use file::{FileTaskLock, FileTaskLockBuilder};

use crate::error::Result;
use crate::models::LockRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Proof of lock ownership returned by a successful acquire
#[derive(Debug)]
pub struct LockHandle {
    task_id: String,
    record: LockRecord,
    reclaimed_from: Option<u32>,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(task_id: impl Into<String>, record: LockRecord) -> Self {
        Self {
            task_id: task_id.into(),
            record,
            reclaimed_from: None,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_reclaimed_from(mut self, pid: u32) -> Self {
        self.reclaimed_from = Some(pid);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// PID of the dead owner whose stale lock was reclaimed, if any
    pub fn reclaimed_from(&self) -> Option<u32> {
        self.reclaimed_from
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Mark released; returns false if it already was
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// Outcome of an acquire call
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockHandle),
    /// Held by a live owner; `None` if the record is unreadable
    AlreadyHeld { owner_pid: Option<u32> },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }

    pub fn into_handle(self) -> Option<LockHandle> {
        match self {
            LockAcquisition::Acquired(handle) => Some(handle),
            LockAcquisition::AlreadyHeld { .. } => None,
        }
    }
}

/// Mutual exclusion keyed by task id
#[async_trait]
pub trait TaskLock: Send + Sync {
    /// Try to take the lock without blocking
    ///
    /// Fails with `ProbeUncertain` when the owner's liveness cannot be
    /// determined; callers retry on a later cycle.
    async fn acquire(&self, task_id: &str, phase: &str) -> Result<LockAcquisition>;

    /// Release a lock; releasing an already-released handle is a no-op
    async fn release(&self, handle: &LockHandle) -> Result<()>;

    /// Whether a live owner currently holds the lock
    async fn is_held(&self, task_id: &str) -> Result<bool>;
}

/// Hostname recorded in lock files
pub fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("HOST").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
