//! Health polling loop
//!
//! Polls every worker concurrently on a fixed interval, updates the runtime
//! registry and broadcasts status changes.

use super::classify::{classify, resource_breach, Observation, Verdict};
use super::{HealthEvent, TelemetrySource};
use crate::context::SupervisionContext;
use crate::error::Result;
use crate::models::{FailureSignature, HealthStatus, WorkerDescriptor};
use crate::observability::{StructuredLogger, SupervisorMetrics};
use crate::probe::LivenessProbe;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default capacity of the health event channel
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Result of polling one worker
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Classified {
        raw: HealthStatus,
        status: HealthStatus,
        signature: Option<FailureSignature>,
    },
    /// Heartbeat stale and liveness unknown; nothing recorded
    Uncertain,
    TelemetryError(String),
}

/// Scheduled polls advance the per-poll counters; on-demand refreshes only
/// read them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollKind {
    Scheduled,
    OnDemand,
}

/// Counters for one polling cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub classified: usize,
    pub unhealthy: usize,
    pub uncertain: usize,
    pub errors: usize,
}

/// Polls telemetry and maintains worker runtime state
pub struct HealthMonitor {
    ctx: Arc<SupervisionContext>,
    telemetry: Arc<dyn TelemetrySource>,
    probe: Arc<dyn LivenessProbe>,
    events: broadcast::Sender<HealthEvent>,
    metrics: Option<SupervisorMetrics>,
    logger: Option<StructuredLogger>,
}

impl HealthMonitor {
    pub fn builder() -> HealthMonitorBuilder {
        HealthMonitorBuilder::new()
    }

    pub fn context(&self) -> &Arc<SupervisionContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Poll every worker once, concurrently
    pub async fn poll_once(self: &Arc<Self>) -> PollSummary {
        let start = Instant::now();
        let mut tasks = JoinSet::new();
        for worker in self.ctx.workers() {
            let monitor = Arc::clone(self);
            let worker = worker.clone();
            tasks.spawn(async move { monitor.poll_worker(&worker, PollKind::Scheduled).await });
        }

        let mut summary = PollSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(PollOutcome::Classified { raw, .. }) => {
                    summary.classified += 1;
                    if raw.is_unhealthy() {
                        summary.unhealthy += 1;
                    }
                }
                Ok(PollOutcome::Uncertain) => summary.uncertain += 1,
                Ok(PollOutcome::TelemetryError(_)) => summary.errors += 1,
                Err(e) => {
                    warn!(error = %e, "Worker poll task failed");
                    summary.errors += 1;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_poll_latency(start.elapsed().as_secs_f64());
            metrics.set_worker_statuses(&self.ctx.registry().status_counts());
        }
        summary
    }

    /// Re-poll a single worker on demand
    ///
    /// The reading is classified against the streak built by scheduled polls;
    /// it does not count as a poll of its own.
    pub async fn refresh(&self, worker_id: &str) -> Result<PollOutcome> {
        let worker = self.ctx.require_worker(worker_id)?.clone();
        Ok(self.poll_worker(&worker, PollKind::OnDemand).await)
    }

    async fn poll_worker(&self, worker: &WorkerDescriptor, kind: PollKind) -> PollOutcome {
        let config = self.ctx.config();
        let sample = match tokio::time::timeout(
            config.telemetry_timeout(),
            self.telemetry.sample(worker),
        )
        .await
        {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => return self.record_telemetry_error(&worker.id, e.to_string()),
            Err(_) => {
                return self.record_telemetry_error(
                    &worker.id,
                    format!("telemetry read timed out after {:?}", config.telemetry_timeout()),
                )
            }
        };

        if !sample.command_signature.is_empty()
            && !sample.command_signature.contains(worker.expected_signature())
        {
            debug!(
                worker_id = %worker.id,
                reported = %sample.command_signature,
                expected = %worker.expected_signature(),
                "Telemetry reports a different command signature"
            );
        }

        let now = Utc::now();
        let heartbeat_age = (now - sample.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let liveness = if heartbeat_age > config.heartbeat_timeout() {
            Some(
                self.probe
                    .is_alive(sample.pid, Some(worker.expected_signature())),
            )
        } else {
            None
        };
        let breach = resource_breach(config, sample.cpu_percent, sample.mem_percent);

        let applied = self.ctx.registry().update(&worker.id, |state| {
            state.pid = Some(sample.pid);
            state.last_heartbeat = Some(sample.last_heartbeat);
            state.push_sample(sample.cpu_percent, sample.mem_percent);
            state.queue_backlog = sample.queue_backlog;
            state.instances = sample.instances;
            state.telemetry_error = None;
            let breach_streak = match (breach, kind) {
                (None, _) => 0,
                (Some(_), PollKind::Scheduled) => state.resource_breach_streak.saturating_add(1),
                (Some(_), PollKind::OnDemand) => state.resource_breach_streak,
            };
            if kind == PollKind::Scheduled {
                state.resource_breach_streak = breach_streak;
            }

            let obs = Observation {
                heartbeat_age,
                liveness,
                breach_streak,
                breach,
                queue_backlog: sample.queue_backlog,
            };
            let classification = match classify(config, &obs) {
                Verdict::Classified(c) => c,
                Verdict::Uncertain => return None,
            };

            let previous = state.status;
            state.last_classification = classification.status;
            state.status = previous.max(classification.status);
            state.classified_at = Some(now);
            if classification.status.is_unhealthy() {
                if kind == PollKind::Scheduled {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                }
                if classification.status >= previous || state.failure_signature.is_none() {
                    state.failure_signature = classification.signature;
                }
            } else if kind == PollKind::Scheduled {
                state.consecutive_failures = 0;
            }

            Some((previous, state.status, classification, state.failure_signature))
        });

        match applied {
            Some(Some((previous, current, classification, signature))) => {
                if previous != current {
                    self.publish(HealthEvent {
                        worker_id: worker.id.clone(),
                        previous,
                        current,
                        raw: classification.status,
                        signature,
                        at: now,
                    });
                }
                PollOutcome::Classified {
                    raw: classification.status,
                    status: current,
                    signature,
                }
            }
            Some(None) => {
                debug!(worker_id = %worker.id, pid = sample.pid, "Heartbeat stale but liveness unknown, skipping cycle");
                PollOutcome::Uncertain
            }
            None => PollOutcome::TelemetryError(format!("worker {} not registered", worker.id)),
        }
    }

    fn record_telemetry_error(&self, worker_id: &str, message: String) -> PollOutcome {
        warn!(worker_id, error = %message, "Telemetry unavailable, skipping worker this cycle");
        if let Some(metrics) = &self.metrics {
            metrics.inc_telemetry_errors();
        }
        self.ctx.registry().update(worker_id, |state| {
            state.telemetry_error = Some(message.clone());
        });
        PollOutcome::TelemetryError(message)
    }

    /// Reset a worker to `Healthy` after a verified recovery
    ///
    /// This is the only path that lowers a stored status.
    pub fn mark_recovered(&self, worker_id: &str) -> bool {
        let max_attempts = self.ctx.config().max_restart_attempts;
        let now = Utc::now();
        let previous = self.ctx.registry().update(worker_id, |state| {
            let previous = state.status;
            state.status = HealthStatus::Healthy;
            state.last_classification = HealthStatus::Healthy;
            state.failure_signature = None;
            state.consecutive_failures = 0;
            state.resource_breach_streak = 0;
            state.remaining_attempts = max_attempts;
            previous
        });

        match previous {
            Some(previous) => {
                if previous != HealthStatus::Healthy {
                    self.publish(HealthEvent {
                        worker_id: worker_id.to_string(),
                        previous,
                        current: HealthStatus::Healthy,
                        raw: HealthStatus::Healthy,
                        signature: None,
                        at: now,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Record that the engine finished an attempt for a worker
    pub fn note_recovery_attempt(&self, worker_id: &str, at: DateTime<Utc>, remaining_attempts: u32) {
        self.ctx.registry().update(worker_id, |state| {
            state.last_recovery = Some(at);
            state.remaining_attempts = remaining_attempts;
        });
    }

    fn publish(&self, event: HealthEvent) {
        if let Some(logger) = &self.logger {
            logger.log_classification(&event.worker_id, event.previous, event.current, event.signature);
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Poll on a fixed interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let poll_interval = self.ctx.config().poll_interval();
        info!(
            interval_secs = poll_interval.as_secs(),
            workers = self.ctx.registry().len(),
            "Starting health monitor"
        );

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_once().await;
                    cycles += 1;
                    if summary.errors > 0 || summary.unhealthy > 0 || cycles % 10 == 0 {
                        debug!(
                            classified = summary.classified,
                            unhealthy = summary.unhealthy,
                            uncertain = summary.uncertain,
                            errors = summary.errors,
                            "Health poll complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health monitor");
                    break;
                }
            }
        }
    }
}

/// Builder for [`HealthMonitor`]
pub struct HealthMonitorBuilder {
    ctx: Option<Arc<SupervisionContext>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    metrics: Option<SupervisorMetrics>,
    logger: Option<StructuredLogger>,
    event_capacity: usize,
}

impl Default for HealthMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitorBuilder {
    pub fn new() -> Self {
        Self {
            ctx: None,
            telemetry: None,
            probe: None,
            metrics: None,
            logger: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn context(mut self, ctx: Arc<SupervisionContext>) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn metrics(mut self, metrics: SupervisorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> anyhow::Result<HealthMonitor> {
        let ctx = self
            .ctx
            .ok_or_else(|| anyhow::anyhow!("Supervision context is required"))?;
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow::anyhow!("Telemetry source is required"))?;
        let probe = self
            .probe
            .ok_or_else(|| anyhow::anyhow!("Liveness probe is required"))?;
        let (events, _) = broadcast::channel(self.event_capacity);

        Ok(HealthMonitor {
            ctx,
            telemetry,
            probe,
            events,
            metrics: self.metrics,
            logger: self.logger,
        })
    }
}

