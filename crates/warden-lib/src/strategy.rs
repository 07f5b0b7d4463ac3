//! Learned recovery strategies
//!
//! Tracks, per (failure signature, action), how often an action worked and
//! ranks candidate actions for the recovery engine. Reads and writes hit an
//! in-memory map; persistence is a periodic flush to a JSON file.

use crate::models::{FailureSignature, RecoveryAction, RecoveryAttempt, StrategyStat};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default weight of the newest outcome
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Default interval between flushes
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct StrategyStoreConfig {
    pub alpha: f64,
    /// Where stats are persisted; `None` keeps them in memory only
    pub persistence_path: Option<PathBuf>,
    pub flush_interval: Duration,
}

impl Default for StrategyStoreConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            persistence_path: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

type StatKey = (FailureSignature, RecoveryAction);

/// Outcome statistics with EWMA ranking
pub struct StrategyStore {
    stats: DashMap<StatKey, StrategyStat>,
    config: StrategyStoreConfig,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
    /// Serializes writers of the persistence file
    flush_lock: Mutex<()>,
}

impl Default for StrategyStore {
    fn default() -> Self {
        Self::with_config(StrategyStoreConfig::default())
    }
}

impl StrategyStore {
    pub fn new(alpha: f64) -> Self {
        Self::with_config(StrategyStoreConfig {
            alpha,
            ..Default::default()
        })
    }

    pub fn with_config(config: StrategyStoreConfig) -> Self {
        Self {
            stats: DashMap::new(),
            config,
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
            flush_lock: Mutex::new(()),
        }
    }

    /// Create a persistent store, loading previous stats if present
    ///
    /// A corrupt file is logged and ignored; learning restarts from scratch.
    pub fn with_persistence(path: impl Into<PathBuf>, alpha: f64) -> Self {
        let path = path.into();
        let store = Self::with_config(StrategyStoreConfig {
            alpha,
            persistence_path: Some(path.clone()),
            ..Default::default()
        });

        if path.exists() {
            if let Err(e) = store.load_from_disk(&path) {
                warn!(path = %path.display(), error = %e, "Failed to load strategy stats, starting fresh");
            }
        }
        store
    }

    pub fn flush_interval(&self) -> Duration {
        self.config.flush_interval
    }

    pub fn set_flush_interval(&mut self, interval: Duration) {
        self.config.flush_interval = interval;
    }

    /// Fold a finished attempt into the stats
    pub fn record_outcome(&self, attempt: &RecoveryAttempt) -> StrategyStat {
        self.record(
            attempt.failure_signature,
            attempt.action,
            attempt.succeeded(),
            attempt.ended_at,
        )
    }

    /// Update the stat for one (signature, action) pair
    pub fn record(
        &self,
        signature: FailureSignature,
        action: RecoveryAction,
        success: bool,
        at: DateTime<Utc>,
    ) -> StrategyStat {
        let alpha = self.config.alpha;
        let observed = if success { 1.0 } else { 0.0 };

        let mut entry = self
            .stats
            .entry((signature, action))
            .or_insert_with(|| StrategyStat {
                failure_signature: signature,
                action,
                attempt_count: 0,
                success_count: 0,
                success_rate: 0.0,
                last_updated: at,
                last_success_at: None,
            });

        let stat = entry.value_mut();
        stat.success_rate = if stat.attempt_count == 0 {
            observed
        } else {
            alpha * observed + (1.0 - alpha) * stat.success_rate
        };
        stat.attempt_count += 1;
        if success {
            stat.success_count += 1;
            stat.last_success_at = Some(at);
        }
        stat.last_updated = at;
        let updated = stat.clone();
        drop(entry);

        self.dirty.store(true, Ordering::SeqCst);
        debug!(
            failure_signature = %signature,
            action = %action,
            success,
            success_rate = updated.success_rate,
            "Strategy stat updated"
        );
        updated
    }

    pub fn get(&self, signature: FailureSignature, action: RecoveryAction) -> Option<StrategyStat> {
        self.stats.get(&(signature, action)).map(|s| s.clone())
    }

    /// Candidate actions, best first
    ///
    /// Tried actions by success rate descending (ties: most recent success
    /// first), then never-tried actions in exploration order.
    pub fn rank_actions(&self, signature: FailureSignature) -> Vec<RecoveryAction> {
        let mut tried: Vec<StrategyStat> = RecoveryAction::ALL
            .iter()
            .filter_map(|action| self.get(signature, *action))
            .filter(|stat| stat.attempt_count > 0)
            .collect();

        tried.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| match (a.last_success_at, b.last_success_at) {
                    (Some(a), Some(b)) => b.cmp(&a),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                })
                .then_with(|| a.action.cmp(&b.action))
        });

        let mut ranked: Vec<RecoveryAction> = tried.iter().map(|s| s.action).collect();
        let untried: Vec<RecoveryAction> = RecoveryAction::ALL
            .iter()
            .copied()
            .filter(|action| !ranked.contains(action))
            .collect();
        ranked.extend(untried);
        ranked
    }

    /// All stats, ordered by signature then action
    pub fn snapshot(&self) -> Vec<StrategyStat> {
        let mut all: Vec<StrategyStat> = self.stats.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| {
            a.failure_signature
                .as_str()
                .cmp(b.failure_signature.as_str())
                .then(a.action.cmp(&b.action))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Flush due: dirty, persistent and the interval has elapsed
    pub fn should_flush(&self) -> bool {
        let elapsed = self
            .last_flush
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.is_dirty()
            && self.config.persistence_path.is_some()
            && elapsed >= self.config.flush_interval
    }

    /// Write stats to disk if anything changed
    pub fn flush(&self) -> Result<()> {
        let Some(path) = self.config.persistence_path.as_ref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let _guard = self
            .flush_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("strategy flush lock poisoned"))?;

        if let Err(e) = self.save_to_disk(path) {
            // Keep the changes for the next flush
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }

        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        debug!(path = %path.display(), entries = self.stats.len(), "Strategy stats flushed to disk");
        Ok(())
    }

    fn save_to_disk(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec_pretty(&self.snapshot())
            .context("Failed to serialize strategy stats")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json)
            .context("Failed to write strategy stats")?;
        file.sync_all().context("Failed to sync strategy file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }

    fn load_from_disk(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read strategy file {:?}", path))?;
        let records: Vec<StrategyStat> =
            serde_json::from_slice(&data).context("Failed to deserialize strategy stats")?;

        for mut stat in records {
            sanitize(&mut stat);
            self.stats
                .insert((stat.failure_signature, stat.action), stat);
        }

        info!(path = %path.display(), entries = self.stats.len(), "Loaded strategy stats from disk");
        Ok(())
    }

    /// Periodically flush until shutdown, then flush one last time
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.should_flush() {
                        if let Err(e) = self.flush() {
                            warn!(error = %e, "Failed to flush strategy stats");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    if let Err(e) = self.flush() {
                        warn!(error = %e, "Failed to flush strategy stats on shutdown");
                    }
                    info!("Strategy store flush loop stopped");
                    break;
                }
            }
        }
    }
}

/// Clamp a loaded record back into its invariants
fn sanitize(stat: &mut StrategyStat) {
    if stat.success_count > stat.attempt_count {
        warn!(
            failure_signature = %stat.failure_signature,
            action = %stat.action,
            "Strategy record has more successes than attempts, clamping"
        );
        stat.success_count = stat.attempt_count;
    }
    if !stat.success_rate.is_finite() {
        stat.success_rate = 0.0;
    }
    stat.success_rate = stat.success_rate.clamp(0.0, 1.0);
}
