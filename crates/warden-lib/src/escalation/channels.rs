//! Built-in escalation channels

use super::{EscalationChannel, EscalationEvent};
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, warn};

/// POSTs events as JSON to an operator webhook
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EscalationChannel for WebhookChannel {
    async fn deliver(&self, event: &EscalationEvent) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook {} responded {}", self.url, status);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Emits events as structured log lines for log-based alerting
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl EscalationChannel for LogChannel {
    async fn deliver(&self, event: &EscalationEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        match event.severity {
            super::EscalationSeverity::Critical => error!(
                event = "escalation",
                worker_id = %event.worker_id,
                failure_signature = %event.failure_signature,
                attempts = event.attempts.len(),
                severity = %event.severity,
                payload = %payload,
                "Worker requires operator attention"
            ),
            super::EscalationSeverity::Warning => warn!(
                event = "escalation",
                worker_id = %event.worker_id,
                failure_signature = %event.failure_signature,
                attempts = event.attempts.len(),
                severity = %event.severity,
                payload = %payload,
                "Worker requires operator attention"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
