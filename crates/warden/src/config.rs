//! Daemon configuration
//!
//! Layered: optional TOML file, then `WARDEN_`-prefixed environment
//! variables (`__` separates nested keys, e.g. `WARDEN_SUPERVISION__POLL_INTERVAL_SECS`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_lib::{RecoveryAction, SupervisionConfig, WorkerDescriptor};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/control
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Supervised workers
    #[serde(default)]
    pub workers: Vec<WorkerDescriptor>,

    /// Command template per action name, e.g. `restart = "systemctl restart {worker_id}"`
    #[serde(default)]
    pub executors: BTreeMap<String, String>,

    /// Directory of `<worker_id>.json` heartbeat files
    #[serde(default = "default_telemetry_dir")]
    pub telemetry_dir: PathBuf,

    /// Directory holding task lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Strategy stats file
    #[serde(default = "default_strategy_path")]
    pub strategy_path: PathBuf,

    /// Strategy flush interval in seconds
    #[serde(default = "default_strategy_flush_interval")]
    pub strategy_flush_interval_secs: u64,

    /// Undelivered escalations survive restarts here
    #[serde(default)]
    pub escalation_spool: Option<PathBuf>,

    /// Escalation webhook; escalations are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,

    /// Retry interval for undelivered escalations
    #[serde(default = "default_escalation_retry")]
    pub escalation_retry_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_telemetry_dir() -> PathBuf {
    PathBuf::from("/var/run/warden/telemetry")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/run/warden/locks")
}

fn default_strategy_path() -> PathBuf {
    PathBuf::from("/var/lib/warden/strategies.json")
}

fn default_strategy_flush_interval() -> u64 {
    30
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_escalation_retry() -> u64 {
    60
}

impl DaemonConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(path.exists()));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: DaemonConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.supervision.validate()?;
        self.executor_actions()?;
        Ok(())
    }

    /// Executor templates keyed by parsed action
    pub fn executor_actions(&self) -> Result<Vec<(RecoveryAction, String)>> {
        self.executors
            .iter()
            .map(|(name, template)| {
                let action = name
                    .parse::<RecoveryAction>()
                    .map_err(|e| anyhow::anyhow!("executors.{}: {}", name, e))?;
                if template.trim().is_empty() {
                    anyhow::bail!("executors.{}: empty command template", name);
                }
                Ok((action, template.clone()))
            })
            .collect()
    }

    pub fn strategy_flush_interval(&self) -> Duration {
        Duration::from_secs(self.strategy_flush_interval_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn escalation_retry(&self) -> Duration {
        Duration::from_secs(self.escalation_retry_secs.max(1))
    }
}
