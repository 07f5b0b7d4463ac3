//! Warden daemon - autonomous worker supervision and recovery
//!
//! Polls worker heartbeats, classifies health, runs ranked recovery actions
//! and escalates to operators when recovery keeps failing.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_agent::{api, config::DaemonConfig};
use warden_lib::{
    escalation::{EscalationChannel, EscalationSink, LogChannel, WebhookChannel},
    health::{components, HealthRegistry},
    lock::{FileTaskLock, LockAcquisition, TaskLock},
    monitor::{FileTelemetrySource, HealthMonitor},
    observability::{StructuredLogger, SupervisorMetrics},
    probe::{LivenessProbe, ProcfsProbe},
    recovery::{CommandExecutor, ExecutorRegistry, RecoveryEngine},
    strategy::StrategyStore,
    SupervisionContext,
};

const WARDEN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lock held for the daemon's lifetime; one supervisor per lock directory
const SUPERVISOR_TASK: &str = "warden-supervisor";

/// Time allowed for background loops to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Autonomous worker supervision daemon")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!("Starting wardend");

    let config = DaemonConfig::load(Some(&args.config))?;
    info!(
        node_name = %config.node_name,
        workers = config.workers.len(),
        "Supervisor configured"
    );

    let health_registry = HealthRegistry::with_supervisor_components().await;
    let metrics = SupervisorMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let probe: Arc<dyn LivenessProbe> = Arc::new(ProcfsProbe::default());
    let mut lock_builder = FileTaskLock::builder(&config.lock_dir, probe.clone());
    if let Some(binary) = own_binary_name() {
        lock_builder = lock_builder.owner_signature(binary);
    }
    let lock: Arc<dyn TaskLock> = Arc::new(lock_builder.build());

    // A dead predecessor's lock is reclaimed here
    let supervisor_handle = match lock.acquire(SUPERVISOR_TASK, "supervise").await? {
        LockAcquisition::Acquired(handle) => handle,
        LockAcquisition::AlreadyHeld { owner_pid } => {
            error!(owner_pid = ?owner_pid, lock_dir = %config.lock_dir.display(), "Another supervisor is running");
            anyhow::bail!("supervisor lock held by pid {:?}", owner_pid);
        }
    };
    if let Some(stale_pid) = supervisor_handle.reclaimed_from() {
        logger.log_lock_reclaimed(SUPERVISOR_TASK, stale_pid);
    }

    let ctx = SupervisionContext::new(config.supervision.clone(), config.workers.clone())?;

    let monitor = Arc::new(
        HealthMonitor::builder()
            .context(ctx.clone())
            .telemetry(Arc::new(FileTelemetrySource::new(&config.telemetry_dir)))
            .probe(probe.clone())
            .metrics(metrics.clone())
            .logger(logger.clone())
            .build()?,
    );

    let mut store =
        StrategyStore::with_persistence(&config.strategy_path, config.supervision.strategy_alpha);
    store.set_flush_interval(config.strategy_flush_interval());
    let store = Arc::new(store);

    let channel: Arc<dyn EscalationChannel> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone(), config.webhook_timeout())?),
        None => {
            warn!("No escalation webhook configured, escalations are only logged");
            Arc::new(LogChannel)
        }
    };
    let mut sink = EscalationSink::new(channel).with_metrics(metrics.clone());
    if let Some(spool) = &config.escalation_spool {
        sink = sink
            .with_spool(spool)
            .await
            .context("Failed to open escalation spool")?;
    }
    let sink = Arc::new(sink);

    let mut executors = ExecutorRegistry::new();
    for (action, template) in config.executor_actions()? {
        executors.register(action, Arc::new(CommandExecutor::from_template(&template)?));
    }

    let engine = Arc::new(
        RecoveryEngine::builder()
            .monitor(monitor.clone())
            .store(store.clone())
            .executors(executors)
            .lock(lock.clone())
            .sink(sink.clone())
            .metrics(metrics.clone())
            .logger(logger.clone())
            .build()?,
    );

    logger.log_startup(WARDEN_VERSION, ctx.registry().len());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        engine.clone(),
        store.clone(),
    ));

    let tasks = vec![
        tokio::spawn(monitor.clone().run(shutdown_tx.subscribe())),
        tokio::spawn(engine.clone().run(shutdown_tx.subscribe())),
        tokio::spawn(store.clone().run_flush_loop(shutdown_tx.subscribe())),
        tokio::spawn(
            sink.clone()
                .run_retry_loop(config.escalation_retry(), shutdown_tx.subscribe()),
        ),
        tokio::spawn(watch_health(
            health_registry.clone(),
            ctx.clone(),
            sink.clone(),
            ctx.config().poll_interval(),
            shutdown_tx.subscribe(),
        )),
    ];
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    logger.log_shutdown("API server failed");
                }
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    if let Err(e) = store.flush() {
        warn!(error = %e, "Final strategy flush failed");
    }
    let pending = sink.pending().await;
    if pending > 0 {
        warn!(pending, channel = sink.channel_name(), "Undelivered escalations remain queued");
    }

    lock.release(&supervisor_handle).await?;
    info!("Shutdown complete");

    Ok(())
}

/// File name of the running executable; every lock owner on this host runs it
fn own_binary_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().into_owned())
}

/// Reflect escalation backlog and telemetry outages in component health
async fn watch_health(
    registry: HealthRegistry,
    ctx: Arc<SupervisionContext>,
    sink: Arc<EscalationSink>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pending = sink.pending().await;
                if pending > 0 {
                    registry
                        .set_degraded(components::ESCALATION, format!("{} undelivered escalations", pending))
                        .await;
                } else {
                    registry.set_healthy(components::ESCALATION).await;
                }

                let workers = ctx.registry().snapshot();
                let blind = workers.iter().filter(|w| w.telemetry_error.is_some()).count();
                if !workers.is_empty() && blind == workers.len() {
                    registry
                        .set_degraded(components::MONITOR, "telemetry unavailable for every worker")
                        .await;
                } else {
                    registry.set_healthy(components::MONITOR).await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
