//! Core data models for the worker supervisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Number of CPU/memory samples kept per worker
pub const SAMPLE_WINDOW: usize = 20;

/// Static identity of a supervised worker, loaded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Logical worker id (unique within a fleet)
    pub id: String,
    /// Launch command
    pub command: String,
    /// Launch arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Queues or roles the worker serves
    #[serde(default)]
    pub queues: Vec<String>,
    /// Critical workers escalate with critical severity
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Expected command-line signature, defaults to `command`
    #[serde(default)]
    pub signature: Option<String>,
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    1
}

impl WorkerDescriptor {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            queues: Vec::new(),
            critical: false,
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            signature: None,
        }
    }

    /// Signature the liveness probe matches against the process command line
    pub fn expected_signature(&self) -> &str {
        self.signature.as_deref().unwrap_or(&self.command)
    }
}

/// Health classification of a worker
///
/// Ordered by severity so the monitor can latch the worst status seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Dead,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, HealthStatus::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker is unhealthy; indexes the strategy store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignature {
    HungProcess,
    ProcessDead,
    ZombieProcess,
    Oom,
    CpuSaturation,
    QueueBacklog,
}

impl FailureSignature {
    pub const ALL: [FailureSignature; 6] = [
        FailureSignature::HungProcess,
        FailureSignature::ProcessDead,
        FailureSignature::ZombieProcess,
        FailureSignature::Oom,
        FailureSignature::CpuSaturation,
        FailureSignature::QueueBacklog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSignature::HungProcess => "hung_process",
            FailureSignature::ProcessDead => "process_dead",
            FailureSignature::ZombieProcess => "zombie_process",
            FailureSignature::Oom => "oom",
            FailureSignature::CpuSaturation => "cpu_saturation",
            FailureSignature::QueueBacklog => "queue_backlog",
        }
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureSignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sig| sig.as_str() == s)
            .ok_or_else(|| format!("unknown failure signature: {}", s))
    }
}

/// Remediation actions, ordered by increasing intrusiveness
///
/// The declaration order doubles as the exploration order for actions
/// that have never been tried for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Restart,
    GracefulRestart,
    ConnectionReset,
    MemoryCleanup,
    ScaleUp,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 5] = [
        RecoveryAction::Restart,
        RecoveryAction::GracefulRestart,
        RecoveryAction::ConnectionReset,
        RecoveryAction::MemoryCleanup,
        RecoveryAction::ScaleUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Restart => "restart",
            RecoveryAction::GracefulRestart => "graceful_restart",
            RecoveryAction::ConnectionReset => "connection_reset",
            RecoveryAction::MemoryCleanup => "memory_cleanup",
            RecoveryAction::ScaleUp => "scale_up",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|a| a.as_str()).collect();
                format!("unknown action '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

/// One telemetry reading for a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub pid: u32,
    pub command_signature: String,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub last_heartbeat: DateTime<Utc>,
    pub queue_backlog: u64,
    /// Number of running instances reported by the worker
    #[serde(default = "default_instances")]
    pub instances: u32,
}

fn default_instances() -> u32 {
    1
}

/// Mutable runtime state of a worker, owned by the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRuntimeState {
    pub worker_id: String,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cpu_samples: VecDeque<f32>,
    pub mem_samples: VecDeque<f32>,
    pub queue_backlog: u64,
    /// Latched status; only a verified recovery lowers it
    pub status: HealthStatus,
    /// Raw classification from the most recent poll
    pub last_classification: HealthStatus,
    pub failure_signature: Option<FailureSignature>,
    pub consecutive_failures: u32,
    pub resource_breach_streak: u32,
    pub last_recovery: Option<DateTime<Utc>>,
    pub remaining_attempts: u32,
    pub instances: u32,
    pub classified_at: Option<DateTime<Utc>>,
    pub telemetry_error: Option<String>,
}

impl WorkerRuntimeState {
    pub fn new(worker_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            pid: None,
            last_heartbeat: None,
            cpu_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            mem_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            queue_backlog: 0,
            status: HealthStatus::Healthy,
            last_classification: HealthStatus::Healthy,
            failure_signature: None,
            consecutive_failures: 0,
            resource_breach_streak: 0,
            last_recovery: None,
            remaining_attempts: max_attempts,
            instances: 0,
            classified_at: None,
            telemetry_error: None,
        }
    }

    /// Append a resource sample, evicting the oldest beyond the window
    pub fn push_sample(&mut self, cpu: f32, mem: f32) {
        if self.cpu_samples.len() >= SAMPLE_WINDOW {
            self.cpu_samples.pop_front();
        }
        if self.mem_samples.len() >= SAMPLE_WINDOW {
            self.mem_samples.pop_front();
        }
        self.cpu_samples.push_back(cpu);
        self.mem_samples.push_back(mem);
    }

    pub fn latest_cpu(&self) -> Option<f32> {
        self.cpu_samples.back().copied()
    }

    pub fn latest_mem(&self) -> Option<f32> {
        self.mem_samples.back().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Why a failed attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ActionFailed,
    ActionTimeout,
    VerificationExpired,
}

/// Immutable record of one recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub worker_id: String,
    pub failure_signature: FailureSignature,
    pub action: RecoveryAction,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub resulting_status: HealthStatus,
}

impl RecoveryAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Outcome statistics for one (signature, action) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStat {
    pub failure_signature: FailureSignature,
    pub action: RecoveryAction,
    pub attempt_count: u64,
    pub success_count: u64,
    /// Exponentially weighted success rate in [0, 1]
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub phase: String,
}

/// Result of running a recovery action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub success: bool,
    pub duration_ms: u64,
}
