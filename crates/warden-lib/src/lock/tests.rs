//! Tests for the file-backed task lock
//!
//! Simulated processes are lock managers with distinct owner PIDs; the
//! forced-kill tests use a real child process and the real process table.

use super::*;
use crate::error::SupervisionError;
use crate::probe::{Liveness, LivenessProbe, ProcfsProbe};
use crate::testing::StaticProbe;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn lock_for(dir: &TempDir, pid: u32, probe: Arc<dyn LivenessProbe>) -> FileTaskLock {
    FileTaskLock::builder(dir.path(), probe)
        .owner_pid(pid)
        .hostname("test-host")
        .build()
}

fn count_winners(results: &[LockAcquisition]) -> usize {
    results.iter().filter(|r| r.is_acquired()).count()
}

#[tokio::test]
async fn test_acquire_release_cycle() {
    let dir = TempDir::new().unwrap();
    let lock = lock_for(&dir, 1000, Arc::new(StaticProbe::all_alive()));

    assert!(!lock.is_held("task-1").await.unwrap());

    let handle = lock
        .acquire("task-1", "recovery")
        .await
        .unwrap()
        .into_handle()
        .expect("lock should be free");
    assert!(lock.is_held("task-1").await.unwrap());
    assert_eq!(handle.record().pid, 1000);
    assert_eq!(handle.record().phase, "recovery");

    lock.release(&handle).await.unwrap();
    assert!(handle.is_released());
    assert!(!lock.is_held("task-1").await.unwrap());
    assert!(!lock.lock_path("task-1").exists());
}

#[tokio::test]
async fn test_lock_file_layout() {
    let dir = TempDir::new().unwrap();
    let lock = lock_for(&dir, 1000, Arc::new(StaticProbe::all_alive()));

    let _handle = lock.acquire("task-7", "sync").await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("task-7.lock")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["pid"], 1000);
    assert_eq!(value["hostname"], "test-host");
    assert_eq!(value["phase"], "sync");
    assert!(value["acquiredAt"].is_string());

    // No temp files left behind
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_double_release_is_noop() {
    let dir = TempDir::new().unwrap();
    let lock = lock_for(&dir, 1000, Arc::new(StaticProbe::all_alive()));

    let handle = lock
        .acquire("task-1", "recovery")
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    lock.release(&handle).await.unwrap();

    // Someone else takes the lock; a second release must not touch it
    let other = lock_for(&dir, 2000, Arc::new(StaticProbe::all_alive()));
    let other_handle = other
        .acquire("task-1", "recovery")
        .await
        .unwrap()
        .into_handle()
        .unwrap();

    lock.release(&handle).await.unwrap();
    assert!(other.is_held("task-1").await.unwrap());
    assert_eq!(
        other.holder("task-1").await.unwrap().unwrap().pid,
        other_handle.record().pid
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_concurrent_acquirers_one_winner() {
    let dir = TempDir::new().unwrap();
    let probe: Arc<dyn LivenessProbe> = Arc::new(StaticProbe::all_alive());
    let first = lock_for(&dir, 4201, probe.clone());
    let second = lock_for(&dir, 4202, probe);

    let (a, b) = tokio::join!(
        first.acquire("task-42", "orchestrate"),
        second.acquire("task-42", "orchestrate")
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let (winner, loser) = match (a, b) {
        (LockAcquisition::Acquired(h), loser @ LockAcquisition::AlreadyHeld { .. }) => (h, loser),
        (loser @ LockAcquisition::AlreadyHeld { .. }, LockAcquisition::Acquired(h)) => (h, loser),
        other => panic!("expected exactly one winner, got {:?}", other),
    };

    match loser {
        LockAcquisition::AlreadyHeld { owner_pid } => {
            assert_eq!(owner_pid, Some(winner.record().pid));
        }
        LockAcquisition::Acquired(_) => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_simulated_processes_single_live_holder() {
    let dir = TempDir::new().unwrap();
    let probe: Arc<dyn LivenessProbe> = Arc::new(StaticProbe::all_alive());

    for round in 0..5 {
        let task_id = format!("task-{}", round);
        let mut handles = Vec::new();
        for pid in 0..16u32 {
            let lock = lock_for(&dir, 10_000 + pid, probe.clone());
            let task_id = task_id.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire(&task_id, "race").await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(count_winners(&results), 1, "round {}", round);
    }
}

#[tokio::test]
async fn test_dead_owner_lock_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(StaticProbe::all_alive());
    probe.set(777, Liveness::NotFound);

    let crashed = lock_for(&dir, 777, probe.clone());
    let _abandoned = crashed.acquire("task-9", "recovery").await.unwrap();

    let survivor = lock_for(&dir, 888, probe.clone());
    assert!(!survivor.is_held("task-9").await.unwrap());

    let handle = survivor
        .acquire("task-9", "recovery")
        .await
        .unwrap()
        .into_handle()
        .expect("stale lock should be reclaimed");
    assert_eq!(handle.reclaimed_from(), Some(777));
    assert_eq!(survivor.holder("task-9").await.unwrap().unwrap().pid, 888);
    assert!(!dir.path().join("task-9.lock.reclaim").exists());
}

#[tokio::test]
async fn test_zombie_and_reused_pid_owners_are_stale() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(StaticProbe::all_alive());
    probe.set(501, Liveness::Zombie);
    probe.set(502, Liveness::SignatureMismatch);

    for (pid, task) in [(501, "zombie-task"), (502, "reused-task")] {
        let old = lock_for(&dir, pid, probe.clone());
        old.acquire(task, "x").await.unwrap();

        let new = lock_for(&dir, 900, probe.clone());
        assert!(new.acquire(task, "x").await.unwrap().is_acquired());
    }
}

#[tokio::test]
async fn test_owner_pid_reused_by_other_program_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let proc_root = TempDir::new().unwrap();
    let pid_dir = proc_root.path().join("4242");
    std::fs::create_dir_all(&pid_dir).unwrap();
    std::fs::write(pid_dir.join("stat"), "4242 (wardend) S 1 1 1 0 -1").unwrap();
    std::fs::write(pid_dir.join("cmdline"), b"/usr/bin/wardend\0--config\0warden.toml\0").unwrap();
    let probe: Arc<dyn LivenessProbe> = Arc::new(ProcfsProbe::new(proc_root.path()));

    let crashed = FileTaskLock::builder(dir.path(), probe.clone())
        .owner_pid(4242)
        .hostname("test-host")
        .owner_signature("wardend")
        .build();
    assert!(crashed.acquire("worker-w1", "recovery").await.unwrap().is_acquired());

    let successor = FileTaskLock::builder(dir.path(), probe.clone())
        .owner_pid(4300)
        .hostname("test-host")
        .owner_signature("wardend")
        .build();
    // Same program still on the PID: held
    assert!(!successor.acquire("worker-w1", "recovery").await.unwrap().is_acquired());

    // The PID now belongs to an unrelated process
    std::fs::write(pid_dir.join("stat"), "4242 (bash) S 1 1 1 0 -1").unwrap();
    std::fs::write(pid_dir.join("cmdline"), b"bash\0").unwrap();
    let handle = successor
        .acquire("worker-w1", "recovery")
        .await
        .unwrap()
        .into_handle()
        .expect("reused pid must not keep the lock");
    assert_eq!(handle.reclaimed_from(), Some(4242));

    // Without an owner signature the reused PID still looks alive
    let unsigned = lock_for(&dir, 4400, probe);
    successor.release(&handle).await.unwrap();
    let plain = lock_for(&dir, 4242, Arc::new(StaticProbe::all_alive()));
    assert!(plain.acquire("worker-w2", "recovery").await.unwrap().is_acquired());
    assert!(!unsigned.acquire("worker-w2", "recovery").await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_unknown_liveness_is_not_reclaimed() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(StaticProbe::all_alive());
    probe.set(600, Liveness::Unknown);

    let owner = lock_for(&dir, 600, probe.clone());
    owner.acquire("task-u", "x").await.unwrap();

    let other = lock_for(&dir, 601, probe);
    match other.acquire("task-u", "x").await {
        Err(e @ SupervisionError::ProbeUncertain { .. }) => {
            assert!(e.is_transient());
            assert_eq!(e.owner_pid(), Some(600));
        }
        other => panic!("expected an uncertain probe, got {:?}", other),
    }
    assert!(other.is_held("task-u").await.unwrap());
    assert_eq!(other.holder("task-u").await.unwrap().unwrap().pid, 600);
}

#[tokio::test]
async fn test_foreign_host_owner_treated_as_alive() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(StaticProbe::new(Liveness::NotFound));

    let remote = FileTaskLock::builder(dir.path(), probe.clone())
        .owner_pid(55)
        .hostname("other-host")
        .build();
    remote.acquire("shared", "x").await.unwrap();

    let local = lock_for(&dir, 56, probe);
    assert!(!local.acquire("shared", "x").await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_unparsable_lock_held_until_grace_expires() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("task-p.lock"), b"{\"pid\":").unwrap();
    let probe: Arc<dyn LivenessProbe> = Arc::new(StaticProbe::all_alive());

    let patient = lock_for(&dir, 1, probe.clone());
    match patient.acquire("task-p", "x").await.unwrap() {
        LockAcquisition::AlreadyHeld { owner_pid } => assert_eq!(owner_pid, None),
        LockAcquisition::Acquired(_) => panic!("young unparsable lock must be respected"),
    }

    let impatient = FileTaskLock::builder(dir.path(), probe)
        .owner_pid(2)
        .hostname("test-host")
        .unparsable_grace(Duration::ZERO)
        .build();
    let handle = impatient
        .acquire("task-p", "x")
        .await
        .unwrap()
        .into_handle()
        .expect("expired unparsable lock should be reclaimed");
    assert_eq!(handle.reclaimed_from(), None);
}

#[tokio::test]
async fn test_abandoned_reclaim_guard_cleared_next_cycle() {
    let dir = TempDir::new().unwrap();
    let probe = Arc::new(StaticProbe::all_alive());
    probe.set(31, Liveness::NotFound);

    lock_for(&dir, 31, probe.clone())
        .acquire("task-g", "x")
        .await
        .unwrap();
    // Guard left behind by a reclaimer that crashed
    std::fs::write(dir.path().join("task-g.lock.reclaim"), b"").unwrap();

    let lock = FileTaskLock::builder(dir.path(), probe)
        .owner_pid(32)
        .hostname("test-host")
        .reclaim_guard_ttl(Duration::ZERO)
        .build();

    assert!(!lock.acquire("task-g", "x").await.unwrap().is_acquired());
    assert!(lock.acquire("task-g", "x").await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_invalid_task_ids_rejected() {
    let dir = TempDir::new().unwrap();
    let lock = lock_for(&dir, 1, Arc::new(StaticProbe::all_alive()));

    assert!(lock.acquire("../escape", "x").await.is_err());
    assert!(lock.acquire("", "x").await.is_err());
    assert!(lock.acquire(".hidden", "x").await.is_err());
    assert!(lock.is_held("a/b").await.is_err());
}

#[cfg(target_os = "linux")]
mod forced_kill {
    use super::*;
    use std::process::{Child, Command};

    fn spawn_holder() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep")
    }

    fn kill_and_reap(mut child: Child) {
        child.kill().expect("failed to kill child");
        child.wait().expect("failed to reap child");
    }

    #[tokio::test]
    async fn test_killed_owner_lock_reclaimed_within_one_attempt() {
        let dir = TempDir::new().unwrap();
        let probe: Arc<dyn LivenessProbe> = Arc::new(ProcfsProbe::default());
        let child = spawn_holder();
        let child_pid = child.id();

        let holder = FileTaskLock::builder(dir.path(), probe.clone())
            .owner_pid(child_pid)
            .build();
        assert!(holder.acquire("job", "hold").await.unwrap().is_acquired());

        let successor = FileTaskLock::new(dir.path(), probe);
        assert!(successor.is_held("job").await.unwrap());
        assert!(!successor.acquire("job", "take").await.unwrap().is_acquired());

        kill_and_reap(child);

        let handle = successor
            .acquire("job", "take")
            .await
            .unwrap()
            .into_handle()
            .expect("lock of killed owner must be reclaimable");
        assert_eq!(handle.reclaimed_from(), Some(child_pid));
        successor.release(&handle).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_racing_reclaimers_never_both_win() {
        for round in 0..10 {
            let dir = TempDir::new().unwrap();
            let probe: Arc<dyn LivenessProbe> = Arc::new(ProcfsProbe::default());
            let child = spawn_holder();

            let holder = FileTaskLock::builder(dir.path(), probe.clone())
                .owner_pid(child.id())
                .build();
            assert!(holder.acquire("job", "hold").await.unwrap().is_acquired());
            kill_and_reap(child);

            let mut tasks = Vec::new();
            for _ in 0..12 {
                let lock = FileTaskLock::new(dir.path(), probe.clone());
                tasks.push(tokio::spawn(async move {
                    lock.acquire("job", "take").await.unwrap()
                }));
            }

            let mut results = Vec::new();
            for task in tasks {
                results.push(task.await.unwrap());
            }
            assert_eq!(count_winners(&results), 1, "round {}", round);
        }
    }
}
