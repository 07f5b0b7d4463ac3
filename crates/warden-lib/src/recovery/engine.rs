//! Recovery state machine
//!
//! Per worker: `Healthy -> Monitoring -> Recovering -> (Healthy | CoolingDown)`,
//! `CoolingDown -> Monitoring` after the cooldown and `-> Escalated` once the
//! attempt budget is spent. Escalated workers wait for an explicit reset.

use super::executor::ExecutorRegistry;
use crate::context::SupervisionContext;
use crate::error::{Result, SupervisionError};
use crate::escalation::{EscalationSeverity, EscalationSink};
use crate::lock::{LockAcquisition, LockHandle, TaskLock};
use crate::models::{
    AttemptOutcome, ExecutionReport, FailureKind, FailureSignature, HealthStatus, RecoveryAction,
    RecoveryAttempt, WorkerDescriptor, WorkerRuntimeState,
};
use crate::monitor::{HealthMonitor, PollOutcome};
use crate::observability::{StructuredLogger, SupervisorMetrics};
use crate::strategy::StrategyStore;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Grace period for in-flight recoveries on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Healthy,
    Monitoring,
    Recovering,
    CoolingDown,
    Escalated,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Healthy => "healthy",
            EngineState::Monitoring => "monitoring",
            EngineState::Recovering => "recovering",
            EngineState::CoolingDown => "cooling_down",
            EngineState::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one evaluation of a worker did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing to do
    Idle,
    /// Another evaluation of this worker is running
    InFlight,
    /// Latest classification older than one polling interval
    Stale,
    CoolingDown,
    /// Worker reclassified healthy; the episode is closed
    SelfHealed,
    /// Worker reads healthy after a failed attempt but has not yet stayed
    /// healthy for a full verification window
    Settling,
    /// Worker lock held by a live owner; retry next cycle
    Deferred { owner_pid: Option<u32> },
    /// No registered executor applies
    NoCandidates,
    Recovered(RecoveryAttempt),
    Failed(RecoveryAttempt),
    Escalated(RecoveryAttempt),
}

/// Engine view of one worker, for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub worker_id: String,
    pub state: EngineState,
    pub attempts: u32,
    pub tried: Vec<RecoveryAction>,
    pub failure_signature: Option<FailureSignature>,
    pub last_attempt: Option<RecoveryAttempt>,
}

#[derive(Debug, Clone)]
struct WorkerTrack {
    state: EngineState,
    attempts: u32,
    tried: BTreeSet<RecoveryAction>,
    history: Vec<RecoveryAttempt>,
    cooldown_until: Option<Instant>,
    signature: Option<FailureSignature>,
    last_attempt: Option<RecoveryAttempt>,
    /// First healthy reading after a failed attempt
    healthy_since: Option<Instant>,
}

impl Default for WorkerTrack {
    fn default() -> Self {
        Self {
            state: EngineState::Healthy,
            attempts: 0,
            tried: BTreeSet::new(),
            history: Vec::new(),
            cooldown_until: None,
            signature: None,
            last_attempt: None,
            healthy_since: None,
        }
    }
}

impl WorkerTrack {
    /// Close the episode and return to `Healthy`
    fn reset(&mut self) {
        let last_attempt = self.last_attempt.take();
        *self = Self {
            last_attempt,
            ..Self::default()
        };
    }
}

/// Removes a worker from the in-flight set when dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    worker_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.worker_id);
        }
    }
}

/// Drives recovery for every supervised worker
pub struct RecoveryEngine {
    ctx: Arc<SupervisionContext>,
    monitor: Arc<HealthMonitor>,
    store: Arc<StrategyStore>,
    executors: ExecutorRegistry,
    lock: Arc<dyn TaskLock>,
    sink: Arc<EscalationSink>,
    tracks: DashMap<String, WorkerTrack>,
    in_flight: Mutex<HashSet<String>>,
    metrics: Option<SupervisorMetrics>,
    logger: Option<StructuredLogger>,
}

/// Lock key guarding recovery of one worker
pub fn worker_lock_id(worker_id: &str) -> String {
    format!("worker-{}", worker_id)
}

impl RecoveryEngine {
    pub fn builder() -> RecoveryEngineBuilder {
        RecoveryEngineBuilder::new()
    }

    pub fn context(&self) -> &Arc<SupervisionContext> {
        &self.ctx
    }

    pub fn state(&self, worker_id: &str) -> EngineState {
        self.tracks
            .get(worker_id)
            .map(|t| t.state)
            .unwrap_or(EngineState::Healthy)
    }

    /// Engine state of every configured worker, ordered by id
    pub fn snapshot(&self) -> Vec<EngineSnapshot> {
        self.ctx
            .worker_ids()
            .into_iter()
            .map(|worker_id| {
                let track = self
                    .tracks
                    .get(&worker_id)
                    .map(|t| t.clone())
                    .unwrap_or_default();
                EngineSnapshot {
                    worker_id,
                    state: track.state,
                    attempts: track.attempts,
                    tried: track.tried.into_iter().collect(),
                    failure_signature: track.signature,
                    last_attempt: track.last_attempt,
                }
            })
            .collect()
    }

    fn with_track<R>(&self, worker_id: &str, f: impl FnOnce(&mut WorkerTrack) -> R) -> R {
        let mut track = self.tracks.entry(worker_id.to_string()).or_default();
        f(track.value_mut())
    }

    fn begin(&self, worker_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(worker_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            worker_id: worker_id.to_string(),
        })
    }

    /// Evaluate one worker and advance its state machine
    pub async fn step(&self, worker_id: &str) -> Result<StepOutcome> {
        let worker = self.ctx.require_worker(worker_id)?.clone();
        let Some(_guard) = self.begin(worker_id) else {
            return Ok(StepOutcome::InFlight);
        };
        let runtime = self
            .ctx
            .registry()
            .get(worker_id)
            .ok_or_else(|| SupervisionError::UnknownWorker(worker_id.to_string()))?;

        let state = self.with_track(worker_id, |track| {
            match track.state {
                EngineState::Healthy if runtime.status.is_unhealthy() => {
                    track.state = EngineState::Monitoring;
                    track.signature = runtime.failure_signature;
                }
                EngineState::CoolingDown => {
                    let elapsed = track
                        .cooldown_until
                        .map(|until| Instant::now() >= until)
                        .unwrap_or(true);
                    if elapsed {
                        track.state = EngineState::Monitoring;
                        track.cooldown_until = None;
                    }
                }
                _ => {}
            }
            track.state
        });

        match state {
            EngineState::Healthy | EngineState::Escalated => Ok(StepOutcome::Idle),
            EngineState::Recovering => Ok(StepOutcome::InFlight),
            EngineState::CoolingDown => Ok(StepOutcome::CoolingDown),
            EngineState::Monitoring => self.evaluate(&worker, &runtime).await,
        }
    }

    async fn evaluate(&self, worker: &WorkerDescriptor, runtime: &WorkerRuntimeState) -> Result<StepOutcome> {
        let config = self.ctx.config();

        if !runtime.status.is_unhealthy() {
            self.with_track(&worker.id, WorkerTrack::reset);
            return Ok(StepOutcome::Idle);
        }

        let fresh = runtime
            .classified_at
            .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO))
            .map(|age| age <= config.poll_interval())
            .unwrap_or(false);
        if !fresh {
            debug!(worker_id = %worker.id, "Classification too old, waiting for the next poll");
            return Ok(StepOutcome::Stale);
        }

        if runtime.last_classification == HealthStatus::Healthy {
            // Once an attempt has failed, the attempt budget only resets after
            // the worker holds healthy for a whole verification window
            let window = config.verification_window();
            let settling = self.with_track(&worker.id, |track| {
                if track.attempts == 0 {
                    return false;
                }
                let since = *track.healthy_since.get_or_insert_with(Instant::now);
                since.elapsed() < window
            });
            if settling {
                debug!(worker_id = %worker.id, "Worker reads healthy, waiting out the verification window");
                return Ok(StepOutcome::Settling);
            }
            info!(worker_id = %worker.id, "Worker recovered on its own");
            self.monitor.mark_recovered(&worker.id);
            self.with_track(&worker.id, WorkerTrack::reset);
            return Ok(StepOutcome::SelfHealed);
        }

        self.with_track(&worker.id, |track| track.healthy_since = None);

        let signature = match runtime.failure_signature {
            Some(signature) => signature,
            None => return Ok(StepOutcome::Idle),
        };

        let task_id = worker_lock_id(&worker.id);
        let handle = match self.lock.acquire(&task_id, "recovery").await {
            Ok(LockAcquisition::Acquired(handle)) => handle,
            Ok(LockAcquisition::AlreadyHeld { owner_pid }) => {
                debug!(worker_id = %worker.id, owner_pid = ?owner_pid, "Worker lock held, deferring");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_lock_contentions();
                }
                return Ok(StepOutcome::Deferred { owner_pid });
            }
            Err(e) if e.is_transient() => {
                debug!(worker_id = %worker.id, error = %e, "Worker lock undecidable, deferring");
                return Ok(StepOutcome::Deferred {
                    owner_pid: e.owner_pid(),
                });
            }
            Err(e) => return Err(e),
        };
        self.note_reclaim(&handle);

        let result = self.attempt(worker, runtime, signature).await;

        if let Err(e) = self.lock.release(&handle).await {
            warn!(worker_id = %worker.id, error = %e, "Failed to release worker lock");
        }
        result
    }

    fn note_reclaim(&self, handle: &LockHandle) {
        if let Some(stale_pid) = handle.reclaimed_from() {
            if let Some(metrics) = &self.metrics {
                metrics.inc_lock_reclaims();
            }
            if let Some(logger) = &self.logger {
                logger.log_lock_reclaimed(handle.task_id(), stale_pid);
            }
        }
    }

    /// Highest-ranked untried action with a registered executor
    fn select_action(&self, worker_id: &str, signature: FailureSignature) -> Option<RecoveryAction> {
        let candidates: Vec<RecoveryAction> = self
            .store
            .rank_actions(signature)
            .into_iter()
            .filter(|action| self.executors.supports(*action))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        self.with_track(worker_id, |track| {
            if candidates.iter().all(|action| track.tried.contains(action)) {
                track.tried.clear();
            }
            candidates
                .iter()
                .copied()
                .find(|action| !track.tried.contains(action))
        })
    }

    async fn attempt(
        &self,
        worker: &WorkerDescriptor,
        runtime: &WorkerRuntimeState,
        signature: FailureSignature,
    ) -> Result<StepOutcome> {
        let config = self.ctx.config();
        let Some(action) = self.select_action(&worker.id, signature) else {
            warn!(worker_id = %worker.id, failure_signature = %signature, "No executor registered for any candidate action");
            return Ok(StepOutcome::NoCandidates);
        };

        let attempt_no = self.with_track(&worker.id, |track| {
            track.state = EngineState::Recovering;
            track.signature = Some(signature);
            track.tried.insert(action);
            track.attempts + 1
        });
        if let Some(logger) = &self.logger {
            logger.log_recovery_started(&worker.id, signature, action, attempt_no);
        }

        let started_at = Utc::now();
        let failure_kind = self.execute_and_verify(worker, runtime, action).await;
        let ended_at = Utc::now();

        let resulting_status = match failure_kind {
            None => HealthStatus::Healthy,
            Some(_) => self
                .ctx
                .registry()
                .get(&worker.id)
                .map(|s| s.status)
                .unwrap_or(runtime.status),
        };
        let attempt = RecoveryAttempt {
            worker_id: worker.id.clone(),
            failure_signature: signature,
            action,
            started_at,
            ended_at,
            outcome: if failure_kind.is_none() {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            },
            failure_kind,
            resulting_status,
        };

        self.store.record_outcome(&attempt);
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(action, attempt.succeeded());
        }
        if let Some(logger) = &self.logger {
            logger.log_recovery_finished(&attempt);
        }

        if attempt.succeeded() {
            self.monitor.mark_recovered(&worker.id);
            self.monitor
                .note_recovery_attempt(&worker.id, ended_at, config.max_restart_attempts);
            self.with_track(&worker.id, |track| {
                track.last_attempt = Some(attempt.clone());
                track.reset();
            });
            return Ok(StepOutcome::Recovered(attempt));
        }

        let (attempts, history) = self.with_track(&worker.id, |track| {
            track.attempts += 1;
            track.history.push(attempt.clone());
            track.last_attempt = Some(attempt.clone());
            if track.attempts >= config.max_restart_attempts {
                track.state = EngineState::Escalated;
                track.cooldown_until = None;
            } else {
                track.state = EngineState::CoolingDown;
                track.cooldown_until = Some(Instant::now() + config.restart_cooldown());
            }
            (track.attempts, track.history.clone())
        });
        self.monitor.note_recovery_attempt(
            &worker.id,
            ended_at,
            config.max_restart_attempts.saturating_sub(attempts),
        );

        if attempts < config.max_restart_attempts {
            return Ok(StepOutcome::Failed(attempt));
        }

        let exhausted = SupervisionError::AttemptsExhausted {
            worker_id: worker.id.clone(),
            attempts,
        };
        warn!(error = %exhausted, failure_signature = %signature, "Escalating worker");
        if let Some(logger) = &self.logger {
            logger.log_escalation(&worker.id, signature, history.len());
        }
        self.sink
            .escalate(
                &worker.id,
                signature,
                history,
                EscalationSeverity::for_worker(worker.critical),
            )
            .await;
        Ok(StepOutcome::Escalated(attempt))
    }

    /// Run the action and wait for a healthy classification; `None` on success
    async fn execute_and_verify(
        &self,
        worker: &WorkerDescriptor,
        runtime: &WorkerRuntimeState,
        action: RecoveryAction,
    ) -> Option<FailureKind> {
        if let Err(e) = self.check_preconditions(worker, runtime, action) {
            warn!(worker_id = %worker.id, action = %action, error = %e, "Action not attempted");
            return Some(FailureKind::ActionFailed);
        }

        match self.run_executor(worker, action).await {
            Ok(report) if report.success => {}
            Ok(_) => return Some(FailureKind::ActionFailed),
            Err(SupervisionError::ActionTimeout { .. }) => return Some(FailureKind::ActionTimeout),
            Err(e) => {
                warn!(worker_id = %worker.id, action = %action, error = %e, "Executor error");
                return Some(FailureKind::ActionFailed);
            }
        }

        if self.verify(&worker.id).await {
            None
        } else {
            Some(FailureKind::VerificationExpired)
        }
    }

    fn check_preconditions(
        &self,
        worker: &WorkerDescriptor,
        runtime: &WorkerRuntimeState,
        action: RecoveryAction,
    ) -> Result<()> {
        if action == RecoveryAction::ScaleUp && runtime.instances >= worker.max_instances {
            return Err(SupervisionError::ActionFailed {
                action,
                reason: format!(
                    "worker already runs {} of max {} instances",
                    runtime.instances, worker.max_instances
                ),
            });
        }
        Ok(())
    }

    async fn run_executor(&self, worker: &WorkerDescriptor, action: RecoveryAction) -> Result<ExecutionReport> {
        let executor = self
            .executors
            .get(action)
            .ok_or(SupervisionError::NoExecutor(action))?;
        let timeout = self.ctx.config().action_timeout();

        match tokio::time::timeout(timeout, executor.execute(worker, action)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(SupervisionError::ActionFailed {
                action,
                reason: format!("{:#}", e),
            }),
            Err(_) => {
                warn!(worker_id = %worker.id, action = %action, timeout_ms = timeout.as_millis() as u64, "Action timed out");
                Err(SupervisionError::ActionTimeout {
                    action,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Re-poll until the worker classifies healthy or the window closes
    async fn verify(&self, worker_id: &str) -> bool {
        let config = self.ctx.config();
        let deadline = Instant::now() + config.verification_window();

        loop {
            match self.monitor.refresh(worker_id).await {
                Ok(PollOutcome::Classified { raw, .. }) if raw == HealthStatus::Healthy => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id, error = %e, "Verification poll failed");
                    return false;
                }
            }
            if Instant::now() + config.verification_poll() > deadline {
                debug!(worker_id, "Verification window expired");
                return false;
            }
            tokio::time::sleep(config.verification_poll()).await;
        }
    }

    /// Run one action outside the state machine
    ///
    /// Still serialized by the worker lock. The outcome is not learned from.
    pub async fn force_action(&self, worker_id: &str, action: RecoveryAction) -> Result<ExecutionReport> {
        let worker = self.ctx.require_worker(worker_id)?.clone();
        if !self.executors.supports(action) {
            return Err(SupervisionError::NoExecutor(action));
        }
        if let Some(runtime) = self.ctx.registry().get(worker_id) {
            self.check_preconditions(&worker, &runtime, action)?;
        }

        let task_id = worker_lock_id(worker_id);
        let handle = match self.lock.acquire(&task_id, "forced").await? {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::AlreadyHeld { owner_pid } => {
                return Err(SupervisionError::LockContended { task_id, owner_pid })
            }
        };
        self.note_reclaim(&handle);

        info!(worker_id, action = %action, "Running operator-requested action");
        let result = self.run_executor(&worker, action).await;

        if let Err(e) = self.lock.release(&handle).await {
            warn!(worker_id, error = %e, "Failed to release worker lock");
        }
        result
    }

    /// Clear the engine state of a worker, including `Escalated`
    pub fn reset(&self, worker_id: &str) -> Result<()> {
        self.ctx.require_worker(worker_id)?;
        self.with_track(worker_id, |track| {
            track.reset();
        });
        self.monitor.mark_recovered(worker_id);
        info!(worker_id, "Worker recovery state reset");
        Ok(())
    }

    /// Evaluate one worker in the background
    pub fn spawn_step(self: &Arc<Self>, worker_id: String) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.step(&worker_id).await {
                Ok(StepOutcome::Idle) | Ok(StepOutcome::InFlight) => {}
                Ok(outcome) => debug!(worker_id = %worker_id, ?outcome, "Recovery step finished"),
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Recovery step failed"),
            }
        })
    }

    /// Evaluate every worker concurrently
    pub fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.ctx
            .worker_ids()
            .into_iter()
            .map(|worker_id| self.spawn_step(worker_id))
            .collect()
    }

    /// React to health events and a periodic ticker until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.monitor.subscribe();
        let mut ticker = interval(self.ctx.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        info!(
            executors = ?self.executors.actions(),
            "Starting recovery engine"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    in_flight.extend(self.tick());
                }
                event = events.recv() => {
                    match event {
                        Ok(event) if event.current.is_unhealthy() => {
                            in_flight.retain(|h| !h.is_finished());
                            in_flight.push(self.spawn_step(event.worker_id));
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Recovery engine lagged behind health events");
                            in_flight.extend(self.tick());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Health event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down recovery engine");
                    break;
                }
            }
        }

        in_flight.retain(|h| !h.is_finished());
        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight recoveries");
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            for handle in in_flight {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let abort = handle.abort_handle();
                if tokio::time::timeout(remaining, handle).await.is_err() {
                    abort.abort();
                }
            }
        }
    }
}

/// Builder for [`RecoveryEngine`]
#[derive(Default)]
pub struct RecoveryEngineBuilder {
    monitor: Option<Arc<HealthMonitor>>,
    store: Option<Arc<StrategyStore>>,
    executors: ExecutorRegistry,
    lock: Option<Arc<dyn TaskLock>>,
    sink: Option<Arc<EscalationSink>>,
    metrics: Option<SupervisorMetrics>,
    logger: Option<StructuredLogger>,
}

impl RecoveryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The monitor also supplies the supervision context
    pub fn monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn store(mut self, store: Arc<StrategyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn lock(mut self, lock: Arc<dyn TaskLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn sink(mut self, sink: Arc<EscalationSink>) -> Self {
        self.sink = Some(sink);
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

    pub fn build(self) -> anyhow::Result<RecoveryEngine> {
        let monitor = self
            .monitor
            .ok_or_else(|| anyhow::anyhow!("Health monitor is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Strategy store is required"))?;
        let lock = self
            .lock
            .ok_or_else(|| anyhow::anyhow!("Task lock is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Escalation sink is required"))?;
        if self.executors.is_empty() {
            warn!("No action executors registered; unhealthy workers will only be escalated");
        }

        Ok(RecoveryEngine {
            ctx: Arc::clone(monitor.context()),
            monitor,
            store,
            executors: self.executors,
            lock,
            sink,
            tracks: DashMap::new(),
            in_flight: Mutex::new(HashSet::new()),
            metrics: self.metrics,
            logger: self.logger,
        })
    }
}
