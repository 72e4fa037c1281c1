//! Ordered job queue.
//!
//! All structural mutation goes through a single instance-scoped mutex. After
//! each mutation a copy of the unfinished jobs is taken under the lock, the
//! lock is released, and the copy is handed to the [`SnapshotStore`]. A
//! revision counter published on a `watch` channel serves as the "queue
//! changed" notification and orders snapshot writes.

use crate::job::{Job, JobId, JobStatus};
use crate::snapshot::SnapshotStore;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// Another active job already writes to this destination
    #[error("A queued job already writes to {0:?}")]
    DuplicateDestination(PathBuf),

    /// No job with the given id
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// The job is currently encoding
    #[error("Job {0} is in progress")]
    JobInProgress(JobId),

    /// Only Error or Completed jobs can be reset to Waiting
    #[error("Job {id} cannot be reset from status {status}")]
    InvalidReset { id: JobId, status: JobStatus },

    /// Jobs enter InProgress only through admission
    #[error("Job {0} can only start through admission")]
    AdmissionRequired(JobId),

    /// The orchestrator is already processing the queue
    #[error("Queue is already processing")]
    AlreadyProcessing,

    /// IO error during import/export
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error during import/export
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: Vec<Job>,
    last_processed: Option<JobId>,
    revision: u64,
}

/// The ordered, mutable list of jobs.
pub struct JobQueue {
    state: Mutex<QueueState>,
    store: Option<Arc<SnapshotStore>>,
    changes: watch::Sender<u64>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .field("revision", &self.revision())
            .finish()
    }
}

impl JobQueue {
    /// Creates an empty queue without persistence.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            store: None,
            changes,
        }
    }

    /// Creates an empty queue that mirrors every mutation to `store`.
    pub fn with_snapshots(store: Arc<SnapshotStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn snapshot_store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a mutation under the lock, then snapshots and notifies.
    ///
    /// The closure returns its result and whether the queue changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState) -> (R, bool)) -> R {
        let (result, revision, copy) = {
            let mut state = self.lock();
            let (result, changed) = f(&mut state);
            if !changed {
                return result;
            }
            state.revision += 1;
            let copy: Option<Vec<Job>> = self.store.as_ref().map(|_| {
                state
                    .jobs
                    .iter()
                    .filter(|job| job.status != JobStatus::Completed)
                    .cloned()
                    .collect()
            });
            (result, state.revision, copy)
        };

        if let (Some(store), Some(jobs)) = (&self.store, copy) {
            store.save(revision, &jobs);
        }
        self.changes.send_replace(revision);
        result
    }

    /// Appends a job without a duplicate check.
    pub fn add(&self, job: Job) {
        debug!(job_id = %job.id, destination = ?job.destination, "Adding job");
        self.mutate(|state| {
            state.jobs.push(job);
            ((), true)
        })
    }

    /// Appends a job unless an active job already writes to its destination.
    pub fn submit(&self, job: Job) -> Result<(), QueueError> {
        self.mutate(|state| {
            if has_destination_duplicate(&state.jobs, &job.destination) {
                return (Err(QueueError::DuplicateDestination(job.destination)), false);
            }
            info!(job_id = %job.id, destination = ?job.destination, "Job queued");
            state.jobs.push(job);
            (Ok(()), true)
        })
    }

    /// Removes a job that is not currently encoding.
    pub fn remove(&self, id: &JobId) -> Result<Job, QueueError> {
        self.mutate(|state| {
            let Some(index) = state.jobs.iter().position(|job| &job.id == id) else {
                return (Err(QueueError::UnknownJob(id.clone())), false);
            };
            if state.jobs[index].status == JobStatus::InProgress {
                return (Err(QueueError::JobInProgress(id.clone())), false);
            }
            (Ok(state.jobs.remove(index)), true)
        })
    }

    /// Swaps the job at `index` with its predecessor. No-op at the top.
    pub fn move_up(&self, index: usize) {
        self.mutate(|state| {
            if index > 0 && index < state.jobs.len() {
                state.jobs.swap(index - 1, index);
            }
            ((), true)
        })
    }

    /// Swaps the job at `index` with its successor. No-op at the bottom.
    pub fn move_down(&self, index: usize) {
        self.mutate(|state| {
            if index + 1 < state.jobs.len() {
                state.jobs.swap(index, index + 1);
            }
            ((), true)
        })
    }

    /// Admits the first Waiting job into execution.
    ///
    /// Atomically marks it InProgress and records it as last processed.
    /// Returns `None` when nothing is waiting or another job is still in
    /// progress.
    pub fn next_job_for_processing(&self) -> Option<Job> {
        self.mutate(|state| {
            if state.jobs.iter().any(|job| job.status == JobStatus::InProgress) {
                debug!("A job is already in progress; not admitting another");
                return (None, false);
            }
            let Some(job) = state
                .jobs
                .iter_mut()
                .find(|job| job.status == JobStatus::Waiting)
            else {
                return (None, false);
            };
            job.set_status(JobStatus::InProgress);
            let job = job.clone();
            state.last_processed = Some(job.id.clone());
            (Some(job), true)
        })
    }

    /// Removes all Completed jobs. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        self.mutate(|state| {
            let before = state.jobs.len();
            state.jobs.retain(|job| job.status != JobStatus::Completed);
            let removed = before - state.jobs.len();
            (removed, removed > 0)
        })
    }

    /// Removes all jobs except the one in progress.
    ///
    /// The running job stays until its completion is recorded, matching
    /// [`JobQueue::remove`] which refuses InProgress jobs.
    pub fn clear(&self) {
        self.mutate(|state| {
            state.jobs.retain(|job| job.status == JobStatus::InProgress);
            ((), true)
        })
    }

    /// Whether an active job already writes to `path`.
    pub fn check_for_destination_duplicate(&self, path: &Path) -> bool {
        has_destination_duplicate(&self.lock().jobs, path)
    }

    /// Puts an Error or Completed job back into the Waiting state.
    pub fn reset_job_status_to_waiting(&self, id: &JobId) -> Result<(), QueueError> {
        self.mutate(|state| {
            let Some(job) = state.jobs.iter_mut().find(|job| &job.id == id) else {
                return (Err(QueueError::UnknownJob(id.clone())), false);
            };
            match job.status {
                JobStatus::Error | JobStatus::Completed => {
                    job.set_status(JobStatus::Waiting);
                    job.statistics = Default::default();
                    (Ok(()), true)
                }
                status => (
                    Err(QueueError::InvalidReset {
                        id: id.clone(),
                        status,
                    }),
                    false,
                ),
            }
        })
    }

    /// Sets a job's status, with a reason when it becomes Error.
    ///
    /// Returns the updated job.
    pub fn set_status(
        &self,
        id: &JobId,
        status: JobStatus,
        reason: Option<&str>,
    ) -> Result<Job, QueueError> {
        self.update(id, |job| match (status, reason) {
            (JobStatus::Error, Some(reason)) => job.fail(reason),
            _ => job.set_status(status),
        })
    }

    /// Applies `f` to a job and returns the updated copy.
    ///
    /// Moving a job into InProgress is rejected with
    /// [`QueueError::AdmissionRequired`] and leaves the job untouched; use
    /// [`JobQueue::next_job_for_processing`] for admission.
    pub fn update(&self, id: &JobId, f: impl FnOnce(&mut Job)) -> Result<Job, QueueError> {
        self.mutate(|state| {
            let Some(job) = state.jobs.iter_mut().find(|job| &job.id == id) else {
                return (Err(QueueError::UnknownJob(id.clone())), false);
            };
            let mut updated = job.clone();
            f(&mut updated);
            if updated.status == JobStatus::InProgress && job.status != JobStatus::InProgress {
                return (Err(QueueError::AdmissionRequired(id.clone())), false);
            }
            *job = updated.clone();
            (Ok(updated), true)
        })
    }

    /// Appends many jobs with a single change notification.
    ///
    /// InProgress jobs are reset to Waiting. Returns the number appended.
    pub fn restore_batch(&self, jobs: Vec<Job>) -> usize {
        if jobs.is_empty() {
            return 0;
        }
        self.mutate(|state| {
            let count = jobs.len();
            state.jobs.extend(jobs.into_iter().map(|mut job| {
                if job.status == JobStatus::InProgress {
                    job.set_status(JobStatus::Waiting);
                }
                job
            }));
            (count, true)
        })
    }

    /// Writes the unfinished jobs to a JSON file.
    pub fn export_json(&self, path: &Path) -> Result<usize, QueueError> {
        let jobs: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|job| job.status != JobStatus::Completed)
            .collect();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&jobs)?)?;
        Ok(jobs.len())
    }

    /// Reads jobs from a JSON file written by [`JobQueue::export_json`].
    ///
    /// Completed jobs and jobs whose destination duplicates an active job are
    /// skipped. Returns the number imported.
    pub fn import_json(&self, path: &Path) -> Result<usize, QueueError> {
        let content = fs::read_to_string(path)?;
        let jobs: Vec<Job> = serde_json::from_str(&content)?;

        let current = self.jobs();
        let mut accepted: Vec<Job> = Vec::new();
        for job in jobs {
            if job.status == JobStatus::Completed {
                continue;
            }
            if has_destination_duplicate(&current, &job.destination)
                || has_destination_duplicate(&accepted, &job.destination)
            {
                warn!(destination = ?job.destination, "Skipping imported job with duplicate destination");
                continue;
            }
            accepted.push(job);
        }

        Ok(self.restore_batch(accepted))
    }

    /// Copy of all jobs in queue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.iter().find(|job| &job.id == id).cloned()
    }

    /// Zero-based position of a job in processing order.
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.lock().jobs.iter().position(|job| &job.id == id)
    }

    /// The job most recently admitted by [`JobQueue::next_job_for_processing`].
    pub fn last_processed(&self) -> Option<Job> {
        let state = self.lock();
        let id = state.last_processed.as_ref()?;
        state.jobs.iter().find(|job| &job.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    pub fn waiting_count(&self) -> usize {
        self.count(JobStatus::Waiting)
    }

    pub fn in_progress_count(&self) -> usize {
        self.count(JobStatus::InProgress)
    }

    pub fn error_count(&self) -> usize {
        self.count(JobStatus::Error)
    }

    /// Jobs that are not Completed: the ones a snapshot has to keep.
    pub fn unfinished_count(&self) -> usize {
        self.lock()
            .jobs
            .iter()
            .filter(|job| job.status != JobStatus::Completed)
            .count()
    }

    fn count(&self, status: JobStatus) -> usize {
        self.lock()
            .jobs
            .iter()
            .filter(|job| job.status == status)
            .count()
    }

    /// Current revision; bumps on every change.
    pub fn revision(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Receiver that observes each new revision.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

fn has_destination_duplicate(jobs: &[Job], path: &Path) -> bool {
    let wanted = normalize_destination(path);
    jobs.iter()
        .filter(|job| job.is_active())
        .any(|job| normalize_destination(&job.destination) == wanted)
}

/// Lexically normalizes a destination path for duplicate detection.
///
/// Backslashes become `/`, `.` components are dropped and `..` pops the
/// preceding normal component. Comparison stays case-sensitive and does not
/// resolve symlinks.
pub fn normalize_destination(path: &Path) -> PathBuf {
    let unified = path.to_string_lossy().replace('\\', "/");
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}
