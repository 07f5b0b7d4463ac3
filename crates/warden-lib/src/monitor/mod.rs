//! Worker health monitoring
//!
//! The monitor polls telemetry for every worker, classifies it and keeps the
//! runtime registry current. Status changes are published as
//! [`HealthEvent`]s; the monitor never decides on recovery.

mod classify;
mod r#loop;
mod telemetry;

#[cfg(test)]
mod tests;

pub use classify::{classify, resource_breach, Classification, Observation, Verdict};
pub use r#loop::{HealthMonitor, HealthMonitorBuilder, PollOutcome, PollSummary};
pub use telemetry::FileTelemetrySource;

use crate::models::{FailureSignature, HealthStatus, TelemetrySample, WorkerDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of per-worker telemetry readings
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self, worker: &WorkerDescriptor) -> anyhow::Result<TelemetrySample>;
}

/// A change of a worker's stored status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    pub worker_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    /// Classification of the poll that caused the change
    pub raw: HealthStatus,
    pub signature: Option<FailureSignature>,
    pub at: DateTime<Utc>,
}
