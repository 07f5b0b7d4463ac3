//! Tests for the health monitor

use super::*;
use crate::config::SupervisionConfig;
use crate::context::SupervisionContext;
use crate::error::SupervisionError;
use crate::models::{
    FailureSignature, HealthStatus, TelemetrySample, WorkerDescriptor, WorkerRuntimeState,
};
use crate::probe::Liveness;
use crate::testing::{healthy_sample, sample_with_heartbeat_age, FakeTelemetry, StaticProbe};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    monitor: Arc<HealthMonitor>,
    telemetry: Arc<FakeTelemetry>,
    probe: Arc<StaticProbe>,
}

fn harness(config: SupervisionConfig, ids: &[&str]) -> Harness {
    let workers = ids
        .iter()
        .map(|id| WorkerDescriptor::new(*id, "worker"))
        .collect();
    let ctx = SupervisionContext::new(config, workers).unwrap();
    let telemetry = Arc::new(FakeTelemetry::new());
    let probe = Arc::new(StaticProbe::all_alive());
    let monitor = HealthMonitor::builder()
        .context(ctx)
        .telemetry(telemetry.clone())
        .probe(probe.clone())
        .build()
        .unwrap();
    Harness {
        monitor: Arc::new(monitor),
        telemetry,
        probe,
    }
}

fn state(h: &Harness, id: &str) -> WorkerRuntimeState {
    h.monitor.context().registry().get(id).unwrap()
}

#[tokio::test]
async fn test_hung_worker_classified_critical() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    let mut events = h.monitor.subscribe();
    h.telemetry.set("w1", sample_with_heartbeat_age(100, 130));

    let summary = h.monitor.poll_once().await;
    assert_eq!(summary.classified, 1);
    assert_eq!(summary.unhealthy, 1);

    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Critical);
    assert_eq!(s.failure_signature, Some(FailureSignature::HungProcess));
    assert_eq!(s.pid, Some(100));

    let event = events.try_recv().unwrap();
    assert_eq!(event.worker_id, "w1");
    assert_eq!(event.previous, HealthStatus::Healthy);
    assert_eq!(event.current, HealthStatus::Critical);
    assert_eq!(event.signature, Some(FailureSignature::HungProcess));
}

#[tokio::test]
async fn test_dead_process_classified_dead() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    h.probe.set(77, Liveness::NotFound);
    h.telemetry.set("w1", sample_with_heartbeat_age(77, 600));

    h.monitor.poll_once().await;
    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Dead);
    assert_eq!(s.failure_signature, Some(FailureSignature::ProcessDead));
}

#[tokio::test]
async fn test_status_latches_until_recovered() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    let mut events = h.monitor.subscribe();
    h.telemetry.set("w1", sample_with_heartbeat_age(100, 130));
    h.monitor.poll_once().await;
    events.try_recv().unwrap();

    // Healthy reading does not lower the stored status
    h.telemetry.set("w1", healthy_sample(100));
    h.monitor.poll_once().await;
    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Critical);
    assert_eq!(s.last_classification, HealthStatus::Healthy);
    assert!(events.try_recv().is_err());

    assert!(h.monitor.mark_recovered("w1"));
    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Healthy);
    assert_eq!(s.failure_signature, None);
    let event = events.try_recv().unwrap();
    assert_eq!(event.current, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_status_never_decreases_across_polls() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    let readings = [
        healthy_sample(1),
        TelemetrySample {
            queue_backlog: 5000,
            ..healthy_sample(1)
        },
        healthy_sample(1),
        sample_with_heartbeat_age(1, 200),
        healthy_sample(1),
    ];

    let mut previous = HealthStatus::Healthy;
    for reading in readings {
        h.telemetry.set("w1", reading);
        h.monitor.poll_once().await;
        let current = state(&h, "w1").status;
        assert!(current >= previous);
        previous = current;
    }
    assert_eq!(previous, HealthStatus::Critical);
}

#[tokio::test]
async fn test_resource_breach_streak() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    let hot = TelemetrySample {
        cpu_percent: 95.0,
        ..healthy_sample(1)
    };
    h.telemetry.set("w1", hot.clone());

    for _ in 0..2 {
        h.monitor.poll_once().await;
    }
    assert_eq!(state(&h, "w1").status, HealthStatus::Healthy);

    h.monitor.poll_once().await;
    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Warning);
    assert_eq!(s.failure_signature, Some(FailureSignature::CpuSaturation));
    assert_eq!(s.resource_breach_streak, 3);

    for _ in 0..3 {
        h.monitor.poll_once().await;
    }
    assert_eq!(state(&h, "w1").status, HealthStatus::Critical);

    // One normal reading breaks the streak
    h.telemetry.set("w1", healthy_sample(1));
    h.monitor.poll_once().await;
    assert_eq!(state(&h, "w1").resource_breach_streak, 0);
}

#[tokio::test]
async fn test_refresh_does_not_advance_breach_streak() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    h.telemetry.set(
        "w1",
        TelemetrySample {
            cpu_percent: 95.0,
            ..healthy_sample(1)
        },
    );
    for _ in 0..3 {
        h.monitor.poll_once().await;
    }
    assert_eq!(state(&h, "w1").status, HealthStatus::Warning);

    for _ in 0..20 {
        let outcome = h.monitor.refresh("w1").await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Classified {
                raw: HealthStatus::Warning,
                ..
            }
        ));
    }
    let s = state(&h, "w1");
    assert_eq!(s.resource_breach_streak, 3);
    assert_eq!(s.consecutive_failures, 3);
    assert_eq!(s.status, HealthStatus::Warning);

    h.monitor.poll_once().await;
    assert_eq!(state(&h, "w1").resource_breach_streak, 4);
}

#[tokio::test]
async fn test_unknown_liveness_skips_worker() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    h.probe.set(5, Liveness::Unknown);
    h.telemetry.set("w1", sample_with_heartbeat_age(5, 600));

    let summary = h.monitor.poll_once().await;
    assert_eq!(summary.uncertain, 1);
    let s = state(&h, "w1");
    assert_eq!(s.status, HealthStatus::Healthy);
    assert!(s.classified_at.is_none());
}

#[tokio::test]
async fn test_telemetry_error_isolated_to_worker() {
    let h = harness(SupervisionConfig::default(), &["bad", "good"]);
    h.telemetry.fail("bad", "connection refused");
    h.telemetry.set("good", sample_with_heartbeat_age(2, 130));

    let summary = h.monitor.poll_once().await;
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.classified, 1);

    let bad = state(&h, "bad");
    assert_eq!(bad.status, HealthStatus::Healthy);
    assert!(bad.telemetry_error.unwrap().contains("connection refused"));
    assert_eq!(state(&h, "good").status, HealthStatus::Critical);

    // Recovered telemetry clears the error
    h.telemetry.set("bad", healthy_sample(3));
    h.monitor.poll_once().await;
    assert!(state(&h, "bad").telemetry_error.is_none());
}

struct StalledTelemetry;

#[async_trait::async_trait]
impl TelemetrySource for StalledTelemetry {
    async fn sample(&self, _worker: &WorkerDescriptor) -> anyhow::Result<TelemetrySample> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::bail!("unreachable")
    }
}

#[tokio::test]
async fn test_telemetry_timeout_counts_as_error() {
    let config = SupervisionConfig {
        telemetry_timeout_ms: 20,
        ..Default::default()
    };
    let ctx = SupervisionContext::new(config, vec![WorkerDescriptor::new("w1", "worker")]).unwrap();
    let monitor = Arc::new(
        HealthMonitor::builder()
            .context(ctx)
            .telemetry(Arc::new(StalledTelemetry))
            .probe(Arc::new(StaticProbe::all_alive()))
            .build()
            .unwrap(),
    );

    let outcome = monitor.refresh("w1").await.unwrap();
    match outcome {
        PollOutcome::TelemetryError(message) => assert!(message.contains("timed out")),
        other => panic!("expected telemetry error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_unknown_worker() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    assert!(matches!(
        h.monitor.refresh("ghost").await,
        Err(SupervisionError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn test_note_recovery_attempt_updates_state() {
    let h = harness(SupervisionConfig::default(), &["w1"]);
    let at = chrono::Utc::now();
    h.monitor.note_recovery_attempt("w1", at, 1);

    let s = state(&h, "w1");
    assert_eq!(s.last_recovery, Some(at));
    assert_eq!(s.remaining_attempts, 1);
}

#[tokio::test]
async fn test_builder_requires_dependencies() {
    assert!(HealthMonitor::builder().build().is_err());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let config = SupervisionConfig {
        poll_interval_secs: 1,
        ..Default::default()
    };
    let h = harness(config, &["w1"]);
    h.telemetry.set("w1", healthy_sample(1));
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = tokio::spawn(h.monitor.clone().run(rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor should stop")
        .unwrap();
    // The first tick fires immediately
    assert!(state(&h, "w1").classified_at.is_some());
}
