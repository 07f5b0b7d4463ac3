//! File-backed task lock
//!
//! Layout: one `<task_id>.lock` file per task under the lock root, holding a
//! JSON [`LockRecord`]. Records are written to a private temp file and then
//! hard-linked into place; the link fails if the lock file already exists,
//! so acquisition is atomic and readers never see a partial record.

use super::{local_hostname, LockAcquisition, LockHandle, TaskLock};
use crate::error::{Result, SupervisionError};
use crate::models::LockRecord;
use crate::probe::{Liveness, LivenessProbe};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Age after which an unparsable lock file counts as stale
const DEFAULT_UNPARSABLE_GRACE: Duration = Duration::from_secs(5);

/// Age after which an abandoned reclaim guard is removed
const DEFAULT_RECLAIM_GUARD_TTL: Duration = Duration::from_secs(30);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What was found at a lock path
#[derive(Debug, Clone)]
enum Observed {
    Missing,
    Record(LockRecord),
    Unparsable { raw: Vec<u8>, age: Duration },
}

impl Observed {
    fn same_as(&self, other: &Observed) -> bool {
        match (self, other) {
            (Observed::Missing, Observed::Missing) => true,
            (Observed::Record(a), Observed::Record(b)) => a == b,
            (Observed::Unparsable { raw: a, .. }, Observed::Unparsable { raw: b, .. }) => a == b,
            _ => false,
        }
    }

    fn owner_pid(&self) -> Option<u32> {
        match self {
            Observed::Record(record) => Some(record.pid),
            _ => None,
        }
    }
}

/// Task lock stored as files under a root directory
pub struct FileTaskLock {
    root: PathBuf,
    probe: Arc<dyn LivenessProbe>,
    owner_pid: u32,
    hostname: String,
    owner_signature: Option<String>,
    unparsable_grace: Duration,
    reclaim_guard_ttl: Duration,
}

impl FileTaskLock {
    /// Create a lock manager owned by the current process
    pub fn new(root: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>) -> Self {
        FileTaskLockBuilder::new(root, probe).build()
    }

    pub fn builder(root: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>) -> FileTaskLockBuilder {
        FileTaskLockBuilder::new(root, probe)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Path of the lock file for a task
    pub fn lock_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{}.lock", task_id))
    }

    fn guard_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{}.lock.reclaim", task_id))
    }

    /// Current record for a task, if one is readable
    pub async fn holder(&self, task_id: &str) -> Result<Option<LockRecord>> {
        validate_task_id(task_id)?;
        match read_observed(&self.lock_path(task_id)).await? {
            Observed::Record(record) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    fn new_record(&self, phase: &str) -> LockRecord {
        LockRecord {
            pid: self.owner_pid,
            hostname: self.hostname.clone(),
            acquired_at: Utc::now(),
            phase: phase.to_string(),
        }
    }

    /// Liveness of a record's owner; foreign hosts cannot be verified
    ///
    /// With an owner signature set, a local PID now running some other
    /// program counts as a dead owner.
    fn owner_liveness(&self, record: &LockRecord) -> Liveness {
        if record.hostname != self.hostname {
            return Liveness::Alive;
        }
        self.probe
            .is_alive(record.pid, self.owner_signature.as_deref())
    }

    /// Classify the owner of a readable record
    ///
    /// `LockStale` means the record may be reclaimed; `ProbeUncertain` means
    /// nobody can tell and the caller must wait.
    fn check_owner(&self, task_id: &str, record: &LockRecord) -> Result<()> {
        match self.owner_liveness(record) {
            Liveness::Unknown => Err(SupervisionError::ProbeUncertain { pid: record.pid }),
            liveness if liveness.is_gone() => Err(SupervisionError::LockStale {
                task_id: task_id.to_string(),
                owner_pid: record.pid,
            }),
            _ => Ok(()),
        }
    }

    fn is_stale(&self, observed: &Observed) -> bool {
        match observed {
            Observed::Missing => false,
            Observed::Record(record) => self.owner_liveness(record).is_gone(),
            Observed::Unparsable { age, .. } => *age >= self.unparsable_grace,
        }
    }

    /// Publish a record at the lock path; `None` if the path is taken
    async fn try_create(&self, task_id: &str, phase: &str) -> Result<Option<LockHandle>> {
        let record = self.new_record(phase);
        let payload = serde_json::to_vec(&record)?;
        let tmp = self.root.join(format!(
            ".{}.{}.{}.tmp",
            task_id,
            self.owner_pid,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        let linked = fs::hard_link(&tmp, self.lock_path(task_id)).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "Failed to remove lock temp file");
        }

        match linked {
            Ok(()) => Ok(Some(LockHandle::new(task_id, record))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the per-task reclaim guard; only its holder may delete a lock file
    async fn try_take_guard(&self, task_id: &str) -> Result<bool> {
        let path = self.guard_path(task_id);
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        match opened {
            Ok(mut file) => {
                let record = serde_json::to_vec(&self.new_record("reclaim"))?;
                file.write_all(&record).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let abandoned = match read_observed(&path).await? {
                    Observed::Missing => false,
                    observed => {
                        self.is_stale(&observed)
                            || file_age(&path)
                                .await
                                .map(|age| age >= self.reclaim_guard_ttl)
                                .unwrap_or(false)
                    }
                };
                // Cleared for the next cycle; this attempt still defers
                if abandoned {
                    warn!(task_id, "Removing abandoned reclaim guard");
                    remove_if_exists(&path).await?;
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a stale lock with our own, at most once
    async fn reclaim(&self, task_id: &str, phase: &str, stale: Observed) -> Result<LockAcquisition> {
        if !self.try_take_guard(task_id).await? {
            debug!(task_id, "Reclaim already in progress elsewhere");
            let current = read_observed(&self.lock_path(task_id)).await?;
            return Ok(LockAcquisition::AlreadyHeld {
                owner_pid: current.owner_pid().or(stale.owner_pid()),
            });
        }

        let result = self.reclaim_under_guard(task_id, phase, &stale).await;

        if let Err(e) = remove_if_exists(&self.guard_path(task_id)).await {
            warn!(task_id, error = %e, "Failed to remove reclaim guard");
        }
        result
    }

    async fn reclaim_under_guard(
        &self,
        task_id: &str,
        phase: &str,
        stale: &Observed,
    ) -> Result<LockAcquisition> {
        let path = self.lock_path(task_id);
        let current = read_observed(&path).await?;

        // Someone else released or reclaimed since we looked
        if !current.same_as(stale) {
            if let Observed::Missing = current {
                return self.create_or_report(task_id, phase).await;
            }
            return Ok(LockAcquisition::AlreadyHeld {
                owner_pid: current.owner_pid(),
            });
        }

        remove_if_exists(&path).await?;
        let stale_pid = stale.owner_pid();
        info!(task_id, stale_pid = ?stale_pid, "Reclaimed stale lock");

        match self.try_create(task_id, phase).await? {
            Some(handle) => Ok(LockAcquisition::Acquired(match stale_pid {
                Some(pid) => handle.with_reclaimed_from(pid),
                None => handle,
            })),
            None => {
                let winner = read_observed(&path).await?;
                Ok(LockAcquisition::AlreadyHeld {
                    owner_pid: winner.owner_pid(),
                })
            }
        }
    }

    async fn create_or_report(&self, task_id: &str, phase: &str) -> Result<LockAcquisition> {
        match self.try_create(task_id, phase).await? {
            Some(handle) => Ok(LockAcquisition::Acquired(handle)),
            None => {
                let current = read_observed(&self.lock_path(task_id)).await?;
                Ok(LockAcquisition::AlreadyHeld {
                    owner_pid: current.owner_pid(),
                })
            }
        }
    }
}

#[async_trait]
impl TaskLock for FileTaskLock {
    async fn acquire(&self, task_id: &str, phase: &str) -> Result<LockAcquisition> {
        validate_task_id(task_id)?;
        fs::create_dir_all(&self.root).await?;

        if let Some(handle) = self.try_create(task_id, phase).await? {
            debug!(task_id, phase, pid = self.owner_pid, "Lock acquired");
            return Ok(LockAcquisition::Acquired(handle));
        }

        let observed = read_observed(&self.lock_path(task_id)).await?;
        match &observed {
            // Released between our create and read
            Observed::Missing => self.create_or_report(task_id, phase).await,
            Observed::Record(record) => match self.check_owner(task_id, record) {
                Ok(()) => Ok(LockAcquisition::AlreadyHeld {
                    owner_pid: Some(record.pid),
                }),
                Err(stale @ SupervisionError::LockStale { .. }) => {
                    debug!(error = %stale, "Reclaiming lock");
                    self.reclaim(task_id, phase, observed).await
                }
                Err(e) => Err(e),
            },
            Observed::Unparsable { .. } if self.is_stale(&observed) => {
                self.reclaim(task_id, phase, observed).await
            }
            Observed::Unparsable { .. } => Ok(LockAcquisition::AlreadyHeld { owner_pid: None }),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        if !handle.mark_released() {
            return Ok(());
        }

        let path = self.lock_path(handle.task_id());
        match read_observed(&path).await? {
            Observed::Record(record) if &record == handle.record() => {
                remove_if_exists(&path).await?;
                debug!(task_id = handle.task_id(), "Lock released");
            }
            Observed::Missing => {
                debug!(task_id = handle.task_id(), "Lock file already gone on release");
            }
            _ => {
                warn!(
                    task_id = handle.task_id(),
                    "Lock file no longer holds our record, leaving it in place"
                );
            }
        }
        Ok(())
    }

    async fn is_held(&self, task_id: &str) -> Result<bool> {
        validate_task_id(task_id)?;
        let observed = read_observed(&self.lock_path(task_id)).await?;
        Ok(!matches!(observed, Observed::Missing) && !self.is_stale(&observed))
    }
}

/// Builder for [`FileTaskLock`]
pub struct FileTaskLockBuilder {
    root: PathBuf,
    probe: Arc<dyn LivenessProbe>,
    owner_pid: u32,
    hostname: Option<String>,
    owner_signature: Option<String>,
    unparsable_grace: Duration,
    reclaim_guard_ttl: Duration,
}

impl FileTaskLockBuilder {
    pub fn new(root: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            root: root.into(),
            probe,
            owner_pid: std::process::id(),
            hostname: None,
            owner_signature: None,
            unparsable_grace: DEFAULT_UNPARSABLE_GRACE,
            reclaim_guard_ttl: DEFAULT_RECLAIM_GUARD_TTL,
        }
    }

    /// Record a different owner PID (used to simulate other processes)
    pub fn owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Command-line fragment every lock owner on this host runs, e.g. the
    /// daemon binary name
    pub fn owner_signature(mut self, signature: impl Into<String>) -> Self {
        self.owner_signature = Some(signature.into());
        self
    }

    pub fn unparsable_grace(mut self, grace: Duration) -> Self {
        self.unparsable_grace = grace;
        self
    }

    pub fn reclaim_guard_ttl(mut self, ttl: Duration) -> Self {
        self.reclaim_guard_ttl = ttl;
        self
    }

    pub fn build(self) -> FileTaskLock {
        FileTaskLock {
            root: self.root,
            probe: self.probe,
            owner_pid: self.owner_pid,
            hostname: self.hostname.unwrap_or_else(local_hostname),
            owner_signature: self.owner_signature,
            unparsable_grace: self.unparsable_grace,
            reclaim_guard_ttl: self.reclaim_guard_ttl,
        }
    }
}

/// Task ids become file names; keep them to a single path component
fn validate_task_id(task_id: &str) -> Result<()> {
    let valid = !task_id.is_empty()
        && !task_id.starts_with('.')
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(SupervisionError::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid task id '{}'", task_id),
        )))
    }
}

async fn read_observed(path: &Path) -> Result<Observed> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Observed::Missing),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<LockRecord>(&raw) {
        Ok(record) => Ok(Observed::Record(record)),
        Err(_) => {
            let age = match file_age(path).await {
                Ok(age) => age,
                Err(SupervisionError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    return Ok(Observed::Missing)
                }
                Err(e) => return Err(e),
            };
            Ok(Observed::Unparsable { raw, age })
        }
    }
}

async fn file_age(path: &Path) -> Result<Duration> {
    let modified = fs::metadata(path).await?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
