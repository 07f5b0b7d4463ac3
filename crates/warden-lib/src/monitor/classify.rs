//! Health classification rules
//!
//! Pure functions over one telemetry reading plus the worker's breach streak.
//! Rules are evaluated in precedence order and the first match wins.

use crate::config::SupervisionConfig;
use crate::models::{FailureSignature, HealthStatus};
use crate::probe::Liveness;
use std::time::Duration;

/// A classification with the failure signature that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: HealthStatus,
    pub signature: Option<FailureSignature>,
}

impl Classification {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            signature: None,
        }
    }

    fn unhealthy(status: HealthStatus, signature: FailureSignature) -> Self {
        Self {
            status,
            signature: Some(signature),
        }
    }
}

/// Inputs to one classification
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub heartbeat_age: Duration,
    /// Only probed when the heartbeat is stale
    pub liveness: Option<Liveness>,
    /// Consecutive polls breaching a resource threshold, this one included
    pub breach_streak: u32,
    /// Signature of this poll's breach, if any
    pub breach: Option<FailureSignature>,
    pub queue_backlog: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Classified(Classification),
    /// Stale heartbeat but the process table could not be read; skip the cycle
    Uncertain,
}

/// Signature of a resource breach in this reading; memory wins over CPU
pub fn resource_breach(config: &SupervisionConfig, cpu: f32, mem: f32) -> Option<FailureSignature> {
    if mem > config.memory_threshold {
        Some(FailureSignature::Oom)
    } else if cpu > config.cpu_threshold {
        Some(FailureSignature::CpuSaturation)
    } else {
        None
    }
}

pub fn classify(config: &SupervisionConfig, obs: &Observation) -> Verdict {
    if obs.heartbeat_age > config.heartbeat_timeout() {
        return match obs.liveness {
            Some(Liveness::Alive) => Verdict::Classified(Classification::unhealthy(
                HealthStatus::Critical,
                FailureSignature::HungProcess,
            )),
            Some(Liveness::Zombie) => Verdict::Classified(Classification::unhealthy(
                HealthStatus::Dead,
                FailureSignature::ZombieProcess,
            )),
            Some(Liveness::NotFound) | Some(Liveness::SignatureMismatch) => Verdict::Classified(
                Classification::unhealthy(HealthStatus::Dead, FailureSignature::ProcessDead),
            ),
            Some(Liveness::Unknown) | None => Verdict::Uncertain,
        };
    }

    if let Some(signature) = obs.breach {
        if obs.breach_streak >= config.breach_polls_critical {
            return Verdict::Classified(Classification::unhealthy(HealthStatus::Critical, signature));
        }
        if obs.breach_streak >= config.breach_polls_warning {
            return Verdict::Classified(Classification::unhealthy(HealthStatus::Warning, signature));
        }
    }

    if obs.queue_backlog > config.queue_backlog_threshold {
        return Verdict::Classified(Classification::unhealthy(
            HealthStatus::Warning,
            FailureSignature::QueueBacklog,
        ));
    }

    Verdict::Classified(Classification::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Observation {
        Observation {
            heartbeat_age: Duration::from_secs(5),
            liveness: None,
            breach_streak: 0,
            breach: None,
            queue_backlog: 0,
        }
    }

    fn status_of(verdict: Verdict) -> (HealthStatus, Option<FailureSignature>) {
        match verdict {
            Verdict::Classified(c) => (c.status, c.signature),
            Verdict::Uncertain => panic!("expected a classification"),
        }
    }

    #[test]
    fn test_stale_heartbeat_with_live_process_is_hung() {
        let config = SupervisionConfig::default();
        let obs = Observation {
            heartbeat_age: Duration::from_secs(130),
            liveness: Some(Liveness::Alive),
            ..fresh()
        };
        assert_eq!(
            status_of(classify(&config, &obs)),
            (HealthStatus::Critical, Some(FailureSignature::HungProcess))
        );
    }

    #[test]
    fn test_stale_heartbeat_with_dead_process() {
        let config = SupervisionConfig::default();
        let stale = Observation {
            heartbeat_age: Duration::from_secs(121),
            ..fresh()
        };

        let zombie = Observation {
            liveness: Some(Liveness::Zombie),
            ..stale
        };
        assert_eq!(
            status_of(classify(&config, &zombie)),
            (HealthStatus::Dead, Some(FailureSignature::ZombieProcess))
        );

        for liveness in [Liveness::NotFound, Liveness::SignatureMismatch] {
            let gone = Observation {
                liveness: Some(liveness),
                ..stale
            };
            assert_eq!(
                status_of(classify(&config, &gone)),
                (HealthStatus::Dead, Some(FailureSignature::ProcessDead))
            );
        }
    }

    #[test]
    fn test_unknown_liveness_skips_cycle() {
        let config = SupervisionConfig::default();
        let obs = Observation {
            heartbeat_age: Duration::from_secs(500),
            liveness: Some(Liveness::Unknown),
            ..fresh()
        };
        assert_eq!(classify(&config, &obs), Verdict::Uncertain);
    }

    #[test]
    fn test_heartbeat_at_timeout_is_not_stale() {
        let config = SupervisionConfig::default();
        let obs = Observation {
            heartbeat_age: Duration::from_secs(120),
            ..fresh()
        };
        assert_eq!(status_of(classify(&config, &obs)).0, HealthStatus::Healthy);
    }

    #[test]
    fn test_breach_streak_thresholds() {
        let config = SupervisionConfig::default();
        let breach = |streak| Observation {
            breach_streak: streak,
            breach: Some(FailureSignature::CpuSaturation),
            ..fresh()
        };

        assert_eq!(status_of(classify(&config, &breach(2))).0, HealthStatus::Healthy);
        assert_eq!(
            status_of(classify(&config, &breach(3))),
            (HealthStatus::Warning, Some(FailureSignature::CpuSaturation))
        );
        assert_eq!(status_of(classify(&config, &breach(5))).0, HealthStatus::Warning);
        assert_eq!(status_of(classify(&config, &breach(6))).0, HealthStatus::Critical);
    }

    #[test]
    fn test_hung_beats_resource_breach() {
        let config = SupervisionConfig::default();
        let obs = Observation {
            heartbeat_age: Duration::from_secs(300),
            liveness: Some(Liveness::Alive),
            breach_streak: 10,
            breach: Some(FailureSignature::Oom),
            queue_backlog: 5000,
        };
        assert_eq!(
            status_of(classify(&config, &obs)).1,
            Some(FailureSignature::HungProcess)
        );
    }

    #[test]
    fn test_queue_backlog_is_warning() {
        let config = SupervisionConfig::default();
        let obs = Observation {
            queue_backlog: 1001,
            ..fresh()
        };
        assert_eq!(
            status_of(classify(&config, &obs)),
            (HealthStatus::Warning, Some(FailureSignature::QueueBacklog))
        );

        let at_limit = Observation {
            queue_backlog: 1000,
            ..fresh()
        };
        assert_eq!(status_of(classify(&config, &at_limit)).0, HealthStatus::Healthy);
    }

    #[test]
    fn test_memory_breach_wins_over_cpu() {
        let config = SupervisionConfig::default();
        assert_eq!(resource_breach(&config, 95.0, 90.0), Some(FailureSignature::Oom));
        assert_eq!(
            resource_breach(&config, 95.0, 10.0),
            Some(FailureSignature::CpuSaturation)
        );
        assert_eq!(resource_breach(&config, 80.0, 85.0), None);
    }
}
