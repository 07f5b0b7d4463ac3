//! Supervision library for long-running workers
//!
//! This crate provides the core functionality for:
//! - Health classification from heartbeat telemetry
//! - Process liveness probing
//! - Distributed task locks with stale-owner reclaim
//! - Learned recovery strategies and the recovery state machine
//! - Escalation to operators
//! - Health checks and observability

pub mod config;
pub mod context;
pub mod error;
pub mod escalation;
pub mod health;
pub mod lock;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod probe;
pub mod recovery;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use config::SupervisionConfig;
pub use context::{SupervisionContext, WorkerRegistry};
pub use error::{Result, SupervisionError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, SupervisorMetrics};
