//! Escalation sink with an at-least-once outbox

use super::EscalationChannel;
use crate::models::{FailureSignature, RecoveryAttempt};
use crate::observability::SupervisorMetrics;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationSeverity {
    Warning,
    Critical,
}

impl EscalationSeverity {
    /// Critical workers page; everything else is a warning
    pub fn for_worker(critical: bool) -> Self {
        if critical {
            EscalationSeverity::Critical
        } else {
            EscalationSeverity::Warning
        }
    }
}

impl std::fmt::Display for EscalationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationSeverity::Warning => write!(f, "warning"),
            EscalationSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Payload handed to operators when recovery is exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EscalationEvent {
    pub worker_id: String,
    pub failure_signature: FailureSignature,
    pub attempts: Vec<RecoveryAttempt>,
    pub severity: EscalationSeverity,
}

/// Forwards escalation events to a channel
pub struct EscalationSink {
    channel: Arc<dyn EscalationChannel>,
    outbox: Mutex<VecDeque<EscalationEvent>>,
    spool_path: Option<PathBuf>,
    metrics: Option<SupervisorMetrics>,
}

impl EscalationSink {
    pub fn new(channel: Arc<dyn EscalationChannel>) -> Self {
        Self {
            channel,
            outbox: Mutex::new(VecDeque::new()),
            spool_path: None,
            metrics: None,
        }
    }

    /// Persist undelivered events to a JSON-lines file, reloading any left over
    pub async fn with_spool(mut self, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let pending = load_spool(&path).await?;
        if !pending.is_empty() {
            info!(path = %path.display(), pending = pending.len(), "Loaded undelivered escalations");
        }
        self.outbox = Mutex::new(pending.into());
        self.spool_path = Some(path);
        Ok(self)
    }

    pub fn with_metrics(mut self, metrics: SupervisorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    /// Hand off one escalation; returns whether the channel accepted it
    ///
    /// A failed hand-off is queued, never retried in-line.
    pub async fn escalate(
        &self,
        worker_id: &str,
        signature: FailureSignature,
        history: Vec<RecoveryAttempt>,
        severity: EscalationSeverity,
    ) -> bool {
        let event = EscalationEvent {
            worker_id: worker_id.to_string(),
            failure_signature: signature,
            attempts: history,
            severity,
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc_escalations();
        }

        match self.channel.deliver(&event).await {
            Ok(()) => {
                debug!(
                    worker_id,
                    channel = self.channel.name(),
                    "Escalation delivered"
                );
                true
            }
            Err(e) => {
                warn!(
                    worker_id,
                    channel = self.channel.name(),
                    error = %e,
                    "Escalation delivery failed, queued for retry"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_escalation_delivery_failures();
                }
                let mut outbox = self.outbox.lock().await;
                outbox.push_back(event);
                self.persist(&outbox).await;
                false
            }
        }
    }

    /// Re-offer queued events in order; returns how many were delivered
    pub async fn flush_pending(&self) -> usize {
        let mut outbox = self.outbox.lock().await;
        if outbox.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut remaining = VecDeque::with_capacity(outbox.len());
        while let Some(event) = outbox.pop_front() {
            match self.channel.deliver(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(worker_id = %event.worker_id, error = %e, "Escalation still undeliverable");
                    remaining.push_back(event);
                }
            }
        }
        *outbox = remaining;
        self.persist(&outbox).await;

        if delivered > 0 {
            info!(delivered, pending = outbox.len(), "Delivered queued escalations");
        }
        delivered
    }

    pub async fn pending(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Periodically retry queued events until shutdown
    pub async fn run_retry_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_pending().await;
                }
                _ = shutdown.recv() => {
                    debug!("Escalation retry loop stopped");
                    break;
                }
            }
        }
    }

    async fn persist(&self, outbox: &VecDeque<EscalationEvent>) {
        let Some(path) = &self.spool_path else {
            return;
        };
        if let Err(e) = write_spool(path, outbox).await {
            warn!(path = %path.display(), error = %e, "Failed to write escalation spool");
        }
    }
}

async fn load_spool(path: &PathBuf) -> anyhow::Result<Vec<EscalationEvent>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read escalation spool {:?}", path))
        }
    };

    let mut events = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EscalationEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping corrupt escalation spool entry"),
        }
    }
    Ok(events)
}

async fn write_spool(path: &PathBuf, outbox: &VecDeque<EscalationEvent>) -> anyhow::Result<()> {
    if outbox.is_empty() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut body = Vec::new();
    for event in outbox {
        serde_json::to_writer(&mut body, event)?;
        body.push(b'\n');
    }

    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
