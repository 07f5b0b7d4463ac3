//! Supervision thresholds and timings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and timings shared by the monitor and the recovery engine
///
/// Every field has a default so partial configuration files deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Health polling interval in seconds
    pub poll_interval_secs: u64,
    /// Heartbeat age after which a worker is considered unresponsive
    pub heartbeat_timeout_secs: u64,
    /// CPU usage percentage considered a breach
    pub cpu_threshold: f32,
    /// Memory usage percentage considered a breach
    pub memory_threshold: f32,
    /// Consecutive breaching polls before `Warning`
    pub breach_polls_warning: u32,
    /// Consecutive breaching polls before `Critical`
    pub breach_polls_critical: u32,
    /// Queue backlog length considered a breach
    pub queue_backlog_threshold: u64,
    /// Window in which a recovered worker must reclassify `Healthy`
    pub verification_window_secs: u64,
    /// Interval between re-polls inside the verification window
    pub verification_poll_ms: u64,
    /// Cooldown after a failed recovery attempt
    pub restart_cooldown_secs: u64,
    /// Attempts before escalation
    pub max_restart_attempts: u32,
    /// Hard executor timeout; defaults to half the cooldown window
    pub action_timeout_secs: Option<u64>,
    /// Weight of the newest outcome in the strategy success rate
    pub strategy_alpha: f64,
    /// Telemetry read timeout per worker
    pub telemetry_timeout_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            breach_polls_warning: 3,
            breach_polls_critical: 6,
            queue_backlog_threshold: 1000,
            verification_window_secs: 60,
            verification_poll_ms: 5_000,
            restart_cooldown_secs: 300,
            max_restart_attempts: 3,
            action_timeout_secs: None,
            strategy_alpha: 0.3,
            telemetry_timeout_ms: 5_000,
        }
    }
}

impl SupervisionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn verification_window(&self) -> Duration {
        Duration::from_secs(self.verification_window_secs)
    }

    pub fn verification_poll(&self) -> Duration {
        Duration::from_millis(self.verification_poll_ms.max(1))
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        match self.action_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.restart_cooldown() / 2,
        }
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.max_restart_attempts == 0 {
            anyhow::bail!("max_restart_attempts must be at least 1");
        }
        if self.breach_polls_warning == 0 || self.breach_polls_critical < self.breach_polls_warning
        {
            anyhow::bail!(
                "breach_polls_critical ({}) must be >= breach_polls_warning ({}) and both positive",
                self.breach_polls_critical,
                self.breach_polls_warning
            );
        }
        if !(0.0..=1.0).contains(&self.strategy_alpha) || self.strategy_alpha == 0.0 {
            anyhow::bail!("strategy_alpha must be in (0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisionConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(120));
        assert_eq!(config.cpu_threshold, 80.0);
        assert_eq!(config.memory_threshold, 85.0);
        assert_eq!(config.verification_window(), Duration::from_secs(60));
        assert_eq!(config.restart_cooldown(), Duration::from_secs(300));
        assert_eq!(config.max_restart_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_action_timeout_derived_from_cooldown() {
        let mut config = SupervisionConfig::default();
        assert_eq!(config.action_timeout(), Duration::from_secs(150));

        config.action_timeout_secs = Some(10);
        assert_eq!(config.action_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_deserialize() {
        let config: SupervisionConfig =
            serde_json::from_str(r#"{"cpu_threshold": 90.0}"#).unwrap();
        assert_eq!(config.cpu_threshold, 90.0);
        assert_eq!(config.max_restart_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_inverted_breach_polls() {
        let config = SupervisionConfig {
            breach_polls_warning: 5,
            breach_polls_critical: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
