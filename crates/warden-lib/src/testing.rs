//! Shared fakes for unit tests

use crate::escalation::{EscalationChannel, EscalationEvent};
use crate::models::{ExecutionReport, RecoveryAction, TelemetrySample, WorkerDescriptor};
use crate::monitor::TelemetrySource;
use crate::probe::{Liveness, LivenessProbe};
use crate::recovery::ActionExecutor;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Probe answering from a fixed table
pub struct StaticProbe {
    table: Mutex<HashMap<u32, Liveness>>,
    default: Liveness,
}

impl StaticProbe {
    pub fn new(default: Liveness) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            default,
        }
    }

    pub fn all_alive() -> Self {
        Self::new(Liveness::Alive)
    }

    pub fn set(&self, pid: u32, liveness: Liveness) {
        self.table.lock().unwrap().insert(pid, liveness);
    }
}

impl LivenessProbe for StaticProbe {
    fn is_alive(&self, pid: u32, _expected_signature: Option<&str>) -> Liveness {
        *self.table.lock().unwrap().get(&pid).unwrap_or(&self.default)
    }
}

/// Telemetry source with per-worker programmable readings
#[derive(Default)]
pub struct FakeTelemetry {
    samples: Mutex<HashMap<String, std::result::Result<TelemetrySample, String>>>,
}

impl FakeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, worker_id: &str, sample: TelemetrySample) {
        self.samples
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), Ok(sample));
    }

    pub fn fail(&self, worker_id: &str, message: &str) {
        self.samples
            .lock()
            .unwrap()
            .insert(worker_id.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetry {
    async fn sample(&self, worker: &WorkerDescriptor) -> anyhow::Result<TelemetrySample> {
        match self.samples.lock().unwrap().get(&worker.id) {
            Some(Ok(sample)) => Ok(sample.clone()),
            Some(Err(message)) => Err(anyhow::anyhow!(message.clone())),
            None => Err(anyhow::anyhow!("no telemetry for {}", worker.id)),
        }
    }
}

/// A healthy reading: fresh heartbeat, low usage, empty queue
pub fn healthy_sample(pid: u32) -> TelemetrySample {
    TelemetrySample {
        pid,
        command_signature: "worker".to_string(),
        cpu_percent: 20.0,
        mem_percent: 30.0,
        last_heartbeat: Utc::now(),
        queue_backlog: 0,
        instances: 1,
    }
}

/// A reading whose heartbeat is `age_secs` old
pub fn sample_with_heartbeat_age(pid: u32, age_secs: i64) -> TelemetrySample {
    TelemetrySample {
        last_heartbeat: Utc::now() - ChronoDuration::seconds(age_secs),
        ..healthy_sample(pid)
    }
}

/// Executor returning scripted outcomes, recording every call
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: bool,
    delay: Duration,
    calls: Mutex<Vec<(String, RecoveryAction)>>,
    invocations: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn always(success: bool) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: success,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, outcomes: &[bool]) -> Self {
        self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<(String, RecoveryAction)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        worker: &WorkerDescriptor,
        action: RecoveryAction,
    ) -> anyhow::Result<ExecutionReport> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((worker.id.clone(), action));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let success = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(ExecutionReport {
            success,
            duration_ms: self.delay.as_millis() as u64,
        })
    }
}

/// Escalation channel collecting events in memory
#[derive(Default)]
pub struct MemoryChannel {
    events: Mutex<Vec<EscalationEvent>>,
    failures_left: AtomicUsize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries
    pub fn failing(n: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(n),
        }
    }

    pub fn events(&self) -> Vec<EscalationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EscalationChannel for MemoryChannel {
    async fn deliver(&self, event: &EscalationEvent) -> anyhow::Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("channel unavailable");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
