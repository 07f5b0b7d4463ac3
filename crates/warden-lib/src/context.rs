//! Shared supervision context
//!
//! One [`SupervisionContext`] is built at startup and handed to every
//! component. It owns the configuration, the worker descriptors and the
//! runtime registry; there is no process-wide supervision state.

use crate::config::SupervisionConfig;
use crate::error::{Result, SupervisionError};
use crate::models::{HealthStatus, WorkerDescriptor, WorkerRuntimeState};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Runtime state of every supervised worker
///
/// Readers get clones; only the health monitor writes.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    states: DashMap<String, WorkerRuntimeState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerRuntimeState> {
        self.states.get(worker_id).map(|s| s.clone())
    }

    /// All states ordered by worker id
    pub fn snapshot(&self) -> Vec<WorkerRuntimeState> {
        let mut all: Vec<WorkerRuntimeState> =
            self.states.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Worker counts per stored status
    pub fn status_counts(&self) -> HashMap<HealthStatus, i64> {
        let mut counts = HashMap::new();
        for state in self.states.iter() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn insert(&self, state: WorkerRuntimeState) {
        self.states.insert(state.worker_id.clone(), state);
    }

    /// Mutate one worker's state in place; `None` if the worker is unknown
    pub(crate) fn update<R>(
        &self,
        worker_id: &str,
        f: impl FnOnce(&mut WorkerRuntimeState) -> R,
    ) -> Option<R> {
        self.states.get_mut(worker_id).map(|mut s| f(s.value_mut()))
    }
}

/// Configuration, worker descriptors and runtime registry
#[derive(Debug)]
pub struct SupervisionContext {
    config: SupervisionConfig,
    workers: BTreeMap<String, WorkerDescriptor>,
    registry: WorkerRegistry,
}

impl SupervisionContext {
    /// Build a context, rejecting invalid config and duplicate worker ids
    pub fn new(config: SupervisionConfig, workers: Vec<WorkerDescriptor>) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let registry = WorkerRegistry::new();
        let mut by_id = BTreeMap::new();
        for worker in workers {
            if worker.id.trim().is_empty() {
                anyhow::bail!("worker id must not be empty");
            }
            if worker.max_instances < worker.min_instances {
                anyhow::bail!(
                    "worker {}: max_instances ({}) is below min_instances ({})",
                    worker.id,
                    worker.max_instances,
                    worker.min_instances
                );
            }
            registry.insert(WorkerRuntimeState::new(
                worker.id.clone(),
                config.max_restart_attempts,
            ));
            if by_id.insert(worker.id.clone(), worker).is_some() {
                anyhow::bail!("duplicate worker id in configuration");
            }
        }

        Ok(Arc::new(Self {
            config,
            workers: by_id,
            registry,
        }))
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(worker_id)
    }

    /// Look up a worker or fail with `UnknownWorker`
    pub fn require_worker(&self, worker_id: &str) -> Result<&WorkerDescriptor> {
        self.worker(worker_id)
            .ok_or_else(|| SupervisionError::UnknownWorker(worker_id.to_string()))
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }
}
