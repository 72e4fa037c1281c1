//! Crash-recovery snapshots of the job queue.
//!
//! Each process writes its unfinished jobs to `queue_<pid>.json` in the state
//! directory after every queue mutation. On startup, files left behind by
//! processes that are no longer running are discovered and their jobs are
//! restored into the live queue.
//!
//! A write goes to `queue_<pid>.json.tmp` first and is renamed over the
//! primary, so the primary always holds one complete snapshot.

use crate::job::{current_timestamp_ms, Job, JobStatus};
use crate::queue::JobQueue;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

const SNAPSHOT_PREFIX: &str = "queue_";
const SNAPSHOT_EXTENSION: &str = ".json";
const PENDING_SUFFIX: &str = ".tmp";

/// Error type for snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// IO error reading or writing a snapshot file
    #[error("Snapshot IO error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot content could not be (de)serialized
    #[error("Snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk content of a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotFile {
    /// Process that owns the snapshot.
    pub pid: u32,
    /// Unix timestamp (milliseconds) of the write.
    pub saved_at: i64,
    pub jobs: Vec<Job>,
}

/// A snapshot file found by [`SnapshotStore::discover`] that is eligible
/// for restore.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSnapshot {
    pub path: PathBuf,
    pub pid: u32,
    pub job_count: usize,
}

/// Decides whether the process owning a snapshot is still running.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness check backed by `sysinfo`.
///
/// A pid only counts as alive when it runs the same executable as the current
/// process, so a recycled pid belonging to an unrelated program does not keep
/// a crashed instance's jobs locked away.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoLiveness;

impl ProcessLiveness for SysinfoLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );

        let Some(other) = sys.process(Pid::from_u32(pid)) else {
            return false;
        };

        match sys.process(Pid::from_u32(std::process::id())) {
            Some(own) => own.name() == other.name(),
            None => true,
        }
    }
}

/// Persists the unfinished part of the queue for crash recovery.
pub struct SnapshotStore {
    dir: PathBuf,
    pid: u32,
    liveness: Arc<dyn ProcessLiveness>,
    /// Revision of the last snapshot written; also serializes writers.
    last_revision: Mutex<Option<u64>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("dir", &self.dir)
            .field("pid", &self.pid)
            .finish()
    }
}

impl SnapshotStore {
    /// Creates a store for the current process using `sysinfo` liveness.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_identity(dir, std::process::id(), Arc::new(SysinfoLiveness))
    }

    /// Creates a store with an explicit owner pid and liveness check.
    pub fn with_identity(
        dir: impl Into<PathBuf>,
        pid: u32,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> Self {
        Self {
            dir: dir.into(),
            pid,
            liveness,
            last_revision: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Path of this process's snapshot file.
    pub fn own_path(&self) -> PathBuf {
        snapshot_path(&self.dir, self.pid)
    }

    /// Writes the non-completed jobs taken at `revision`.
    ///
    /// Saves older than the last written revision are skipped. Failures are
    /// logged and swallowed.
    pub fn save(&self, revision: u64, jobs: &[Job]) {
        let mut last = self
            .last_revision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if matches!(*last, Some(written) if written > revision) {
            debug!(revision, "Skipping stale queue snapshot");
            return;
        }

        match self.write_snapshot(jobs) {
            Ok(()) => *last = Some(revision),
            Err(e) => warn!(path = ?self.own_path(), error = %e, "Failed to save queue snapshot"),
        }
    }

    fn write_snapshot(&self, jobs: &[Job]) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.own_path();
        let pending = pending_path(&path);

        let file = SnapshotFile {
            pid: self.pid,
            saved_at: current_timestamp_ms(),
            jobs: jobs
                .iter()
                .filter(|job| job.status != JobStatus::Completed)
                .cloned()
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        fs::write(&pending, json)?;
        fs::rename(&pending, &path)?;

        Ok(())
    }

    /// Loads a snapshot file.
    pub fn load(path: &Path) -> Result<SnapshotFile, SnapshotError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Scans the state directory for snapshots left behind by other processes.
    ///
    /// Leftover pending writes of dead owners are settled first: one newer
    /// than a readable primary (or standing in for a missing or torn one) is
    /// promoted, anything else is removed. Empty snapshots are removed; files
    /// owned by a live process and unreadable files are skipped.
    pub fn discover(&self) -> Vec<DiscoveredSnapshot> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "Failed to scan snapshot directory");
                return Vec::new();
            }
        };

        let mut primaries = Vec::new();
        let mut pending = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(primary) = name.strip_suffix(PENDING_SUFFIX) {
                if let Some(pid) = parse_snapshot_pid(primary) {
                    pending.push((pid, path.clone()));
                }
            } else if let Some(pid) = parse_snapshot_pid(name) {
                primaries.push((pid, path));
            }
        }

        for (pid, leftover) in pending {
            if pid == self.pid || self.liveness.is_alive(pid) {
                continue;
            }
            let primary = snapshot_path(&self.dir, pid);
            if settle_pending(&leftover, &primary) && !primaries.iter().any(|(p, _)| *p == pid) {
                primaries.push((pid, primary));
            }
        }

        primaries.sort_by_key(|(pid, _)| *pid);

        let mut found = Vec::new();
        for (pid, path) in primaries {
            if pid == self.pid {
                continue;
            }
            if self.liveness.is_alive(pid) {
                debug!(pid, path = ?path, "Snapshot belongs to a running instance; leaving it");
                continue;
            }

            let snapshot = match Self::load(&path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable queue snapshot");
                    continue;
                }
            };

            if snapshot.jobs.is_empty() {
                debug!(path = ?path, "Removing empty queue snapshot");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = ?path, error = %e, "Failed to remove empty snapshot");
                }
                continue;
            }

            found.push(DiscoveredSnapshot {
                path,
                pid,
                job_count: snapshot.jobs.len(),
            });
        }

        found
    }

    /// Restores a snapshot's jobs into `queue` and deletes the file.
    ///
    /// InProgress jobs are reset to Waiting and completed jobs are dropped.
    /// The file is kept when it belongs to another live process.
    /// Returns the number of jobs restored.
    pub fn restore(&self, path: &Path, queue: &JobQueue) -> Result<usize, SnapshotError> {
        let snapshot = Self::load(path)?;

        let jobs: Vec<Job> = snapshot
            .jobs
            .into_iter()
            .filter(|job| job.status != JobStatus::Completed)
            .map(|mut job| {
                if job.status == JobStatus::InProgress {
                    job.set_status(JobStatus::Waiting);
                }
                job
            })
            .collect();

        let restored = queue.restore_batch(jobs);

        let foreign_live = snapshot.pid != self.pid && self.liveness.is_alive(snapshot.pid);
        if !foreign_live && snapshot.pid != self.pid {
            fs::remove_file(path)?;
        }

        info!(path = ?path, restored, "Restored jobs from queue snapshot");
        Ok(restored)
    }

    /// Discovers and restores every eligible snapshot into `queue`.
    ///
    /// Unreadable files are logged and skipped. Returns the total restored.
    pub fn recover_into(&self, queue: &JobQueue) -> usize {
        let mut total = 0;
        for snapshot in self.discover() {
            match self.restore(&snapshot.path, queue) {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(path = ?snapshot.path, error = %e, "Failed to restore queue snapshot")
                }
            }
        }
        total
    }

    /// Removes this process's snapshot on clean shutdown.
    pub fn delete_own(&self) -> Result<(), SnapshotError> {
        for path in [self.own_path(), pending_path(&self.own_path())] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn snapshot_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{}{}{}", SNAPSHOT_PREFIX, pid, SNAPSHOT_EXTENSION))
}

fn pending_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PENDING_SUFFIX);
    PathBuf::from(name)
}

/// Resolves a pending write left by a dead owner against its primary.
///
/// The pending file replaces the primary only when it is readable and the
/// primary is missing, unreadable or older. Otherwise it is removed.
/// Returns whether it was promoted.
fn settle_pending(pending: &Path, primary: &Path) -> bool {
    let candidate = match SnapshotStore::load(pending) {
        Ok(candidate) => candidate,
        Err(e) => {
            debug!(path = ?pending, error = %e, "Discarding torn pending snapshot");
            if let Err(e) = fs::remove_file(pending) {
                warn!(path = ?pending, error = %e, "Failed to remove pending snapshot");
            }
            return false;
        }
    };

    let newer = match SnapshotStore::load(primary) {
        Ok(current) => candidate.saved_at > current.saved_at,
        Err(_) => true,
    };
    if !newer {
        debug!(path = ?pending, "Discarding pending snapshot older than its primary");
        if let Err(e) = fs::remove_file(pending) {
            warn!(path = ?pending, error = %e, "Failed to remove pending snapshot");
        }
        return false;
    }

    match fs::rename(pending, primary) {
        Ok(()) => {
            info!(path = ?primary, "Promoted interrupted snapshot write");
            true
        }
        Err(e) => {
            warn!(path = ?pending, error = %e, "Failed to promote pending snapshot");
            false
        }
    }
}

/// Extracts the owner pid from a `queue_<pid>.json` file name.
fn parse_snapshot_pid(name: &str) -> Option<u32> {
    name.strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_EXTENSION)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::testing::FixedLiveness;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_for(dir: &Path, pid: u32, alive: &[u32]) -> SnapshotStore {
        SnapshotStore::with_identity(dir, pid, Arc::new(FixedLiveness::new(alive.to_vec())))
    }

    fn job(dest: &str, status: JobStatus) -> Job {
        let mut job = Job::new(format!("/in/{}", dest), format!("/out/{}", dest), json!([]));
        job.status = status;
        job
    }

    #[test]
    fn test_parse_snapshot_pid() {
        assert_eq!(parse_snapshot_pid("queue_4242.json"), Some(4242));
        assert_eq!(parse_snapshot_pid("queue_.json"), None);
        assert_eq!(parse_snapshot_pid("queue_12.json.tmp"), None);
        assert_eq!(parse_snapshot_pid("encode_12.log"), None);
    }

    #[test]
    fn test_save_excludes_completed_jobs() {
        let temp = TempDir::new().unwrap();
        let store = store_for(temp.path(), 100, &[]);

        store.save(
            1,
            &[
                job("a.mp4", JobStatus::Waiting),
                job("b.mp4", JobStatus::Completed),
                job("c.mp4", JobStatus::Error),
            ],
        );

        let file = SnapshotStore::load(&store.own_path()).unwrap();
        assert_eq!(file.pid, 100);
        assert_eq!(file.jobs.len(), 2);
        assert!(file.jobs.iter().all(|j| j.status != JobStatus::Completed));
        assert!(!pending_path(&store.own_path()).exists());
    }

    #[test]
    fn test_stale_revision_is_not_written() {
        let temp = TempDir::new().unwrap();
        let store = store_for(temp.path(), 100, &[]);

        store.save(5, &[job("new.mp4", JobStatus::Waiting)]);
        store.save(4, &[job("old.mp4", JobStatus::Waiting)]);

        let file = SnapshotStore::load(&store.own_path()).unwrap();
        assert_eq!(file.jobs.len(), 1);
        assert_eq!(file.jobs[0].destination, PathBuf::from("/out/new.mp4"));
    }

    #[test]
    fn test_save_failure_is_swallowed() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        let store = store_for(&blocker, 100, &[]);
        store.save(1, &[job("a.mp4", JobStatus::Waiting)]);
        assert!(!store.own_path().exists());
    }

    #[test]
    fn test_discover_skips_live_own_and_unreadable() {
        let temp = TempDir::new().unwrap();
        let dead = store_for(temp.path(), 1, &[]);
        let live = store_for(temp.path(), 2, &[]);
        let own = store_for(temp.path(), 3, &[2]);
        dead.save(1, &[job("a.mp4", JobStatus::Waiting)]);
        live.save(1, &[job("b.mp4", JobStatus::Waiting)]);
        own.save(1, &[job("c.mp4", JobStatus::Waiting)]);
        fs::write(temp.path().join("queue_9.json"), "{ not json").unwrap();

        let found = own.discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 1);
        assert_eq!(found[0].job_count, 1);
        assert!(temp.path().join("queue_9.json").exists());
    }

    #[test]
    fn test_discover_deletes_empty_snapshots() {
        let temp = TempDir::new().unwrap();
        let crashed = store_for(temp.path(), 7, &[]);
        crashed.save(1, &[job("done.mp4", JobStatus::Completed)]);
        assert!(crashed.own_path().exists());

        let own = store_for(temp.path(), 8, &[]);
        assert!(own.discover().is_empty());
        assert!(!crashed.own_path().exists());
    }

    fn write_file(path: &Path, saved_at: i64, jobs: Vec<Job>) {
        let file = SnapshotFile {
            pid: 7,
            saved_at,
            jobs,
        };
        fs::write(path, serde_json::to_string(&file).unwrap()).unwrap();
    }

    #[test]
    fn test_discover_promotes_pending_over_torn_primary() {
        let temp = TempDir::new().unwrap();
        let primary = snapshot_path(temp.path(), 7);
        write_file(&pending_path(&primary), 1_000, vec![job("a.mp4", JobStatus::Waiting)]);
        fs::write(&primary, "{\"pid\": 7, \"jobs\": [").unwrap();

        let own = store_for(temp.path(), 8, &[]);
        let found = own.discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_count, 1);
        assert!(!pending_path(&primary).exists());
    }

    #[test]
    fn test_discover_keeps_newer_primary_over_stale_pending() {
        let temp = TempDir::new().unwrap();
        let primary = snapshot_path(temp.path(), 7);
        write_file(
            &primary,
            2_000,
            vec![job("a.mp4", JobStatus::Waiting), job("b.mp4", JobStatus::Waiting)],
        );
        write_file(&pending_path(&primary), 1_000, vec![job("a.mp4", JobStatus::Waiting)]);

        let own = store_for(temp.path(), 8, &[]);
        let found = own.discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_count, 2);
        assert!(!pending_path(&primary).exists());
        assert_eq!(SnapshotStore::load(&primary).unwrap().jobs.len(), 2);
    }

    #[test]
    fn test_discover_promotes_complete_pending_write() {
        let temp = TempDir::new().unwrap();
        let primary = snapshot_path(temp.path(), 7);
        write_file(&primary, 1_000, vec![job("a.mp4", JobStatus::Waiting)]);
        write_file(
            &pending_path(&primary),
            2_000,
            vec![job("a.mp4", JobStatus::Waiting), job("b.mp4", JobStatus::Waiting)],
        );

        let own = store_for(temp.path(), 8, &[]);
        let found = own.discover();
        assert_eq!(found[0].job_count, 2);
        assert!(!pending_path(&primary).exists());
    }

    #[test]
    fn test_discover_drops_torn_pending_write() {
        let temp = TempDir::new().unwrap();
        let primary = snapshot_path(temp.path(), 7);
        write_file(&primary, 1_000, vec![job("a.mp4", JobStatus::Waiting)]);
        fs::write(pending_path(&primary), "{\"pid\": 7, \"sav").unwrap();

        let own = store_for(temp.path(), 8, &[]);
        let found = own.discover();
        assert_eq!(found[0].job_count, 1);
        assert!(!pending_path(&primary).exists());
    }

    #[test]
    fn test_pending_write_of_live_owner_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let primary = snapshot_path(temp.path(), 7);
        write_file(&primary, 1_000, vec![job("a.mp4", JobStatus::Waiting)]);
        write_file(&pending_path(&primary), 2_000, vec![job("b.mp4", JobStatus::Waiting)]);

        let own = store_for(temp.path(), 8, &[7]);
        assert!(own.discover().is_empty());
        assert!(pending_path(&primary).exists());
    }

    #[test]
    fn test_restore_resets_in_progress_and_deletes_file() {
        let temp = TempDir::new().unwrap();
        let crashed = store_for(temp.path(), 7, &[]);
        crashed.save(
            1,
            &[job("a.mp4", JobStatus::InProgress), job("b.mp4", JobStatus::Waiting)],
        );

        let own = store_for(temp.path(), 8, &[]);
        let queue = JobQueue::new();
        let restored = own.restore(&crashed.own_path(), &queue).unwrap();

        assert_eq!(restored, 2);
        let jobs = queue.jobs();
        assert_eq!(jobs[0].destination, PathBuf::from("/out/a.mp4"));
        assert!(jobs.iter().all(|j| j.status == JobStatus::Waiting));
        assert!(!crashed.own_path().exists());
    }

    #[test]
    fn test_restore_keeps_file_of_live_owner() {
        let temp = TempDir::new().unwrap();
        let other = store_for(temp.path(), 7, &[]);
        other.save(1, &[job("a.mp4", JobStatus::Waiting)]);

        let own = store_for(temp.path(), 8, &[7]);
        let queue = JobQueue::new();
        own.restore(&other.own_path(), &queue).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(other.own_path().exists());
    }

    #[test]
    fn test_recover_into_collects_all_dead_snapshots() {
        let temp = TempDir::new().unwrap();
        store_for(temp.path(), 1, &[]).save(1, &[job("a.mp4", JobStatus::Waiting)]);
        store_for(temp.path(), 2, &[]).save(
            1,
            &[job("b.mp4", JobStatus::Error), job("c.mp4", JobStatus::InProgress)],
        );

        let own = store_for(temp.path(), 3, &[]);
        let queue = JobQueue::new();
        assert_eq!(own.recover_into(&queue), 3);
        assert_eq!(queue.in_progress_count(), 0);
        assert_eq!(queue.error_count(), 1);
    }

    #[test]
    fn test_delete_own_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = store_for(temp.path(), 5, &[]);
        store.save(1, &[job("a.mp4", JobStatus::Waiting)]);

        store.delete_own().unwrap();
        assert!(!store.own_path().exists());
        store.delete_own().unwrap();
    }
}
