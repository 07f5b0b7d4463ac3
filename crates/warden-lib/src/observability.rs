//! Observability infrastructure for the supervisor
//!
//! Provides:
//! - Prometheus metrics (poll latency, worker status, recovery outcomes, escalations)
//! - Structured JSON logging with tracing

use crate::models::{
    FailureSignature, HealthStatus, RecoveryAction, RecoveryAttempt,
};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for poll latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SupervisorMetricsInner> = OnceLock::new();

struct SupervisorMetricsInner {
    poll_latency_seconds: Histogram,
    workers_by_status: IntGaugeVec,
    recovery_attempts: IntCounterVec,
    escalations: IntCounter,
    escalation_delivery_failures: IntCounter,
    lock_contentions: IntCounter,
    lock_reclaims: IntCounter,
    telemetry_errors: IntCounter,
}

impl SupervisorMetricsInner {
    fn new() -> Self {
        Self {
            poll_latency_seconds: register_histogram!(
                "warden_poll_latency_seconds",
                "Time spent polling telemetry for all workers",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register poll_latency_seconds"),

            workers_by_status: register_int_gauge_vec!(
                "warden_workers",
                "Number of supervised workers by health status",
                &["status"]
            )
            .expect("Failed to register workers"),

            recovery_attempts: register_int_counter_vec!(
                "warden_recovery_attempts_total",
                "Recovery attempts by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register recovery_attempts_total"),

            escalations: register_int_counter!(
                "warden_escalations_total",
                "Workers escalated to operators"
            )
            .expect("Failed to register escalations_total"),

            escalation_delivery_failures: register_int_counter!(
                "warden_escalation_delivery_failures_total",
                "Escalation deliveries that failed and were queued for retry"
            )
            .expect("Failed to register escalation_delivery_failures_total"),

            lock_contentions: register_int_counter!(
                "warden_lock_contentions_total",
                "Recovery attempts deferred because the worker lock was held"
            )
            .expect("Failed to register lock_contentions_total"),

            lock_reclaims: register_int_counter!(
                "warden_lock_reclaims_total",
                "Stale locks reclaimed from dead owners"
            )
            .expect("Failed to register lock_reclaims_total"),

            telemetry_errors: register_int_counter!(
                "warden_telemetry_errors_total",
                "Telemetry reads that failed or timed out"
            )
            .expect("Failed to register telemetry_errors_total"),
        }
    }
}

/// Supervisor metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct SupervisorMetrics {
    _private: (),
}

impl Default for SupervisorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SupervisorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SupervisorMetricsInner {
        GLOBAL_METRICS.get_or_init(SupervisorMetricsInner::new)
    }

    pub fn observe_poll_latency(&self, duration_secs: f64) {
        self.inner().poll_latency_seconds.observe(duration_secs);
    }

    /// Replace the per-status worker gauges
    pub fn set_worker_statuses(&self, counts: &HashMap<HealthStatus, i64>) {
        for status in [
            HealthStatus::Healthy,
            HealthStatus::Warning,
            HealthStatus::Critical,
            HealthStatus::Dead,
        ] {
            self.inner()
                .workers_by_status
                .with_label_values(&[status.as_str()])
                .set(counts.get(&status).copied().unwrap_or(0));
        }
    }

    pub fn record_attempt(&self, action: RecoveryAction, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .recovery_attempts
            .with_label_values(&[action.as_str(), outcome])
            .inc();
    }

    pub fn inc_escalations(&self) {
        self.inner().escalations.inc();
    }

    pub fn inc_escalation_delivery_failures(&self) {
        self.inner().escalation_delivery_failures.inc();
    }

    pub fn inc_lock_contentions(&self) {
        self.inner().lock_contentions.inc();
    }

    pub fn inc_lock_reclaims(&self) {
        self.inner().lock_reclaims.inc();
    }

    pub fn inc_telemetry_errors(&self) {
        self.inner().telemetry_errors.inc();
    }
}

/// Structured logger for supervisor events
///
/// Every line carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log a status change produced by the health monitor
    pub fn log_classification(
        &self,
        worker_id: &str,
        previous: HealthStatus,
        current: HealthStatus,
        signature: Option<FailureSignature>,
    ) {
        let signature = signature.map(|s| s.as_str()).unwrap_or("none");
        if current > previous {
            warn!(
                event = "worker_classified",
                node = %self.node_name,
                worker_id = %worker_id,
                previous = %previous,
                current = %current,
                failure_signature = %signature,
                "Worker health degraded"
            );
        } else {
            info!(
                event = "worker_classified",
                node = %self.node_name,
                worker_id = %worker_id,
                previous = %previous,
                current = %current,
                failure_signature = %signature,
                "Worker health changed"
            );
        }
    }

    pub fn log_recovery_started(
        &self,
        worker_id: &str,
        signature: FailureSignature,
        action: RecoveryAction,
        attempt: u32,
    ) {
        info!(
            event = "recovery_started",
            node = %self.node_name,
            worker_id = %worker_id,
            failure_signature = %signature,
            action = %action,
            attempt = attempt,
            "Starting recovery action"
        );
    }

    pub fn log_recovery_finished(&self, attempt: &RecoveryAttempt) {
        let duration_ms = (attempt.ended_at - attempt.started_at).num_milliseconds();
        if attempt.succeeded() {
            info!(
                event = "recovery_finished",
                node = %self.node_name,
                worker_id = %attempt.worker_id,
                failure_signature = %attempt.failure_signature,
                action = %attempt.action,
                outcome = "success",
                duration_ms = duration_ms,
                "Recovery verified"
            );
        } else {
            warn!(
                event = "recovery_finished",
                node = %self.node_name,
                worker_id = %attempt.worker_id,
                failure_signature = %attempt.failure_signature,
                action = %attempt.action,
                outcome = "failure",
                failure_kind = ?attempt.failure_kind,
                resulting_status = %attempt.resulting_status,
                duration_ms = duration_ms,
                "Recovery attempt failed"
            );
        }
    }

    pub fn log_escalation(&self, worker_id: &str, signature: FailureSignature, attempts: usize) {
        warn!(
            event = "worker_escalated",
            node = %self.node_name,
            worker_id = %worker_id,
            failure_signature = %signature,
            attempts = attempts,
            "Recovery exhausted, escalating to operators"
        );
    }

    pub fn log_lock_reclaimed(&self, task_id: &str, stale_pid: u32) {
        warn!(
            event = "lock_reclaimed",
            node = %self.node_name,
            task_id = %task_id,
            stale_pid = stale_pid,
            "Reclaimed lock from dead owner"
        );
    }

    pub fn log_startup(&self, version: &str, workers: usize) {
        info!(
            event = "supervisor_started",
            node = %self.node_name,
            version = %version,
            workers = workers,
            "Worker supervisor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "supervisor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Worker supervisor shutting down"
        );
    }
}
