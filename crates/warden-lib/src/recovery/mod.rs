//! Recovery engine
//!
//! Turns unhealthy classifications into ranked remediation attempts, verifies
//! them, learns from the outcome and escalates when the attempt budget is
//! spent.

mod engine;
mod executor;


pub use engine::{
    worker_lock_id, EngineSnapshot, EngineState, RecoveryEngine, RecoveryEngineBuilder,
    StepOutcome,
};
pub use executor::{ActionExecutor, CommandExecutor, ExecutorRegistry};
