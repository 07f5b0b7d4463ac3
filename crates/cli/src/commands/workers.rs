//! Worker status and control commands

use anyhow::Result;
use chrono::Utc;
use tabled::Tabled;
use warden_lib::RecoveryAction;

use crate::client::{ApiClient, RecoverRequest, RecoverResult, ResetResult, WorkerSummary};
use crate::output::{
    color_status, format_age, format_percent, print_error, print_json, print_rows, print_success,
    OutputFormat,
};

/// Row for the worker status table
#[derive(Tabled)]
struct WorkerRow {
    #[tabled(rename = "Worker")]
    worker_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Signature")]
    signature: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Heartbeat")]
    heartbeat: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Mem")]
    mem: String,
    #[tabled(rename = "Backlog")]
    backlog: u64,
    #[tabled(rename = "Recovery")]
    engine: String,
    #[tabled(rename = "Attempts Left")]
    remaining: u32,
}

fn worker_row(w: &WorkerSummary, now: chrono::DateTime<Utc>) -> WorkerRow {
    WorkerRow {
        worker_id: w.worker_id.clone(),
        status: color_status(w.status.as_str()),
        signature: w
            .failure_signature
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
        pid: w
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        heartbeat: match &w.telemetry_error {
            Some(_) => "unavailable".to_string(),
            None => format_age(w.last_heartbeat, now),
        },
        cpu: format_percent(w.cpu_percent),
        mem: format_percent(w.mem_percent),
        backlog: w.queue_backlog,
        engine: color_status(w.engine_state.as_str()),
        remaining: w.remaining_attempts,
    }
}

/// Show runtime state of every worker
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let workers: Vec<WorkerSummary> = client.get("api/v1/workers").await?;

    match format {
        OutputFormat::Json => print_json(&workers)?,
        OutputFormat::Table => {
            let now = Utc::now();
            let unhealthy = workers.iter().filter(|w| w.status.is_unhealthy()).count();
            let rows: Vec<WorkerRow> = workers.iter().map(|w| worker_row(w, now)).collect();
            print_rows(rows, "No workers configured");
            if !workers.is_empty() {
                println!("\n{} workers, {} unhealthy", workers.len(), unhealthy);
            }
        }
    }

    Ok(())
}

/// Run one action against a worker; returns whether the action succeeded
pub async fn recover(
    client: &ApiClient,
    worker_id: &str,
    action: RecoveryAction,
    format: OutputFormat,
) -> Result<bool> {
    let path = format!("api/v1/workers/{}/recover", worker_id);
    let result: RecoverResult = client.post(&path, &RecoverRequest { action }).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            if result.success {
                print_success(&format!(
                    "{} on {} succeeded in {}ms",
                    action, worker_id, result.duration_ms
                ));
            } else {
                let reason = result
                    .error
                    .as_deref()
                    .unwrap_or("executor reported failure");
                print_error(&format!("{} on {} failed: {}", action, worker_id, reason));
            }
        }
    }

    Ok(result.success)
}

/// Clear the recovery state of a worker, including escalation
pub async fn reset(client: &ApiClient, worker_id: &str, format: OutputFormat) -> Result<()> {
    let path = format!("api/v1/workers/{}/reset", worker_id);
    let result: ResetResult = client.post(&path, &serde_json::json!({})).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Worker {} reset ({})",
                result.worker_id, result.state
            ));
        }
    }

    Ok(())
}
