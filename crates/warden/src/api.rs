//! HTTP API for health checks, Prometheus metrics and operator control

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use warden_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::SupervisorMetrics,
    recovery::{EngineState, RecoveryEngine},
    strategy::StrategyStore,
    FailureSignature, HealthStatus, RecoveryAction, StrategyStat, SupervisionContext,
    SupervisionError,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SupervisorMetrics,
    pub ctx: Arc<SupervisionContext>,
    pub engine: Arc<RecoveryEngine>,
    pub store: Arc<StrategyStore>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: SupervisorMetrics,
        engine: Arc<RecoveryEngine>,
        store: Arc<StrategyStore>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            ctx: Arc::clone(engine.context()),
            engine,
            store,
        }
    }
}

/// Runtime and engine view of one worker
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
    pub worker_id: String,
    pub status: HealthStatus,
    pub last_classification: HealthStatus,
    pub failure_signature: Option<FailureSignature>,
    pub pid: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f32>,
    pub mem_percent: Option<f32>,
    pub queue_backlog: u64,
    pub instances: u32,
    pub remaining_attempts: u32,
    pub last_recovery: Option<DateTime<Utc>>,
    pub telemetry_error: Option<String>,
    pub engine_state: EngineState,
    pub attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub action: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverResponse {
    pub worker_id: String,
    pub action: RecoveryAction,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub worker_id: String,
    pub state: EngineState,
}

/// Error body for control endpoints
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<SupervisionError> for ApiError {
    fn from(err: SupervisionError) -> Self {
        let status = match &err {
            SupervisionError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            SupervisionError::NoExecutor(_) => StatusCode::BAD_REQUEST,
            e if e.is_transient() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerView>> {
    let engine: std::collections::HashMap<String, _> = state
        .engine
        .snapshot()
        .into_iter()
        .map(|s| (s.worker_id.clone(), s))
        .collect();

    let views = state
        .ctx
        .registry()
        .snapshot()
        .into_iter()
        .map(|runtime| {
            let track = engine.get(&runtime.worker_id);
            WorkerView {
                cpu_percent: runtime.latest_cpu(),
                mem_percent: runtime.latest_mem(),
                engine_state: track.map(|t| t.state).unwrap_or(EngineState::Healthy),
                attempts: track.map(|t| t.attempts).unwrap_or(0),
                worker_id: runtime.worker_id,
                status: runtime.status,
                last_classification: runtime.last_classification,
                failure_signature: runtime.failure_signature,
                pid: runtime.pid,
                last_heartbeat: runtime.last_heartbeat,
                queue_backlog: runtime.queue_backlog,
                instances: runtime.instances,
                remaining_attempts: runtime.remaining_attempts,
                last_recovery: runtime.last_recovery,
                telemetry_error: runtime.telemetry_error,
            }
        })
        .collect();
    Json(views)
}

async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<Vec<StrategyStat>> {
    Json(state.store.snapshot())
}

async fn recover_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(request): Json<RecoverRequest>,
) -> Result<Json<RecoverResponse>, ApiError> {
    let action: RecoveryAction = request.action.parse().map_err(ApiError::bad_request)?;
    info!(worker_id = %worker_id, action = %action, "Operator requested recovery");

    let response = match state.engine.force_action(&worker_id, action).await {
        Ok(report) => RecoverResponse {
            worker_id,
            action,
            success: report.success,
            duration_ms: report.duration_ms,
            error: None,
        },
        Err(e @ (SupervisionError::ActionTimeout { .. } | SupervisionError::ActionFailed { .. })) => {
            RecoverResponse {
                worker_id,
                action,
                success: false,
                duration_ms: 0,
                error: Some(e.to_string()),
            }
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(response))
}

async fn reset_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    state.engine.reset(&worker_id)?;
    Ok(Json(ResetResponse {
        state: state.engine.state(&worker_id),
        worker_id,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/strategies", get(list_strategies))
        .route("/api/v1/workers/:id/recover", post(recover_worker))
        .route("/api/v1/workers/:id/reset", post(reset_worker))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
