//! Queue orchestrator: the sequencing state machine.
//!
//! The orchestrator pulls jobs from the [`JobQueue`] one at a time and drives
//! an [`EncodeExecutor`]. Executor events are consumed by a listener task;
//! queue-level events are published on a broadcast channel.
//!
//! States: `Idle -> Processing -> {Paused, Completed}`, `Paused -> Processing`
//! on resume and `Completed -> Processing` on a fresh start.

use crate::executor::{EncodeExecutor, EncodeOutcome, ExecutorEvent};
use crate::health::SystemProbe;
use crate::host::HostControl;
use crate::job::{current_timestamp_ms, Job, JobId, JobStatus};
use crate::progress::EncodeProgress;
use crate::queue::{JobQueue, QueueError};
use encode_queue_config::{Config, PostQueueAction};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Processing,
    Paused,
    Completed,
}

/// Why the queue stopped processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Manual,
    JobError,
    LowBattery,
    LowDisk,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Manual => write!(f, "manual"),
            PauseReason::JobError => write!(f, "job-error"),
            PauseReason::LowBattery => write!(f, "low-battery"),
            PauseReason::LowDisk => write!(f, "low-disk"),
        }
    }
}

/// Progress of the running job together with its place in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    /// Zero-based position of the job in the queue.
    pub job_index: usize,
    pub job_count: usize,
    pub progress: EncodeProgress,
}

/// Events published to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobStarted(Job),
    ProgressChanged(ProgressSnapshot),
    JobCompleted {
        job: Job,
        success: bool,
        error: Option<String>,
    },
    QueuePaused(PauseReason),
    QueueCompleted,
    /// The `quit_app` post-queue action: the application should exit.
    QuitRequested,
}

/// Behaviour switches for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub logging_enabled: bool,
    pub clear_completed_on_finish: bool,
    pub post_queue_action: PostQueueAction,
    pub pause_on_low_disk: bool,
    pub min_free_disk_bytes: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            logging_enabled: config.encoder.logging_enabled,
            clear_completed_on_finish: config.queue.clear_completed_on_finish,
            post_queue_action: config.queue.post_queue_action,
            pause_on_low_disk: config.health.pause_on_low_disk,
            min_free_disk_bytes: config.health.min_free_disk_bytes,
        }
    }
}

#[derive(Debug)]
struct Status {
    state: QueueState,
    pause_reason: Option<PauseReason>,
}

struct Inner {
    queue: Arc<JobQueue>,
    executor: Arc<dyn EncodeExecutor>,
    host: Arc<dyn HostControl>,
    probe: Arc<dyn SystemProbe>,
    settings: OrchestratorSettings,
    status: Mutex<Status>,
    /// Serializes job admission and completion handling.
    sequencing: tokio::sync::Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

/// Drives the queue through the executor one job at a time.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueueOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueOrchestrator")
            .field("state", &self.state())
            .field("pause_reason", &self.pause_reason())
            .field("executor", &self.inner.executor.name())
            .finish()
    }
}

impl QueueOrchestrator {
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<dyn EncodeExecutor>,
        host: Arc<dyn HostControl>,
        probe: Arc<dyn SystemProbe>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queue,
                executor,
                host,
                probe,
                settings,
                status: Mutex::new(Status {
                    state: QueueState::Idle,
                    pause_reason: None,
                }),
                sequencing: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    pub fn executor(&self) -> &Arc<dyn EncodeExecutor> {
        &self.inner.executor
    }

    pub fn host(&self) -> &Arc<dyn HostControl> {
        &self.inner.host
    }

    pub fn state(&self) -> QueueState {
        self.status().state
    }

    /// Why the queue is paused, if it is.
    pub fn pause_reason(&self) -> Option<PauseReason> {
        let status = self.status();
        match status.state {
            QueueState::Paused => status.pause_reason,
            _ => None,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state() == QueueState::Processing
    }

    /// Subscribes to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Starts or resumes processing.
    ///
    /// Fails with [`QueueError::AlreadyProcessing`] when already processing.
    /// Resuming a paused executor continues its job; if a job is still
    /// running no second job is started.
    pub async fn start(&self) -> Result<(), QueueError> {
        let _seq = self.inner.sequencing.lock().await;

        let previous = {
            let mut status = self.status();
            if status.state == QueueState::Processing {
                return Err(QueueError::AlreadyProcessing);
            }
            let previous = status.state;
            status.state = QueueState::Processing;
            status.pause_reason = None;
            previous
        };
        info!(from = ?previous, "Queue processing started");

        let rx = self.inner.executor.subscribe();
        tokio::spawn(self.clone().listen(rx));

        if self.inner.executor.is_encoding() {
            if self.inner.executor.is_paused() {
                if let Err(e) = self.inner.executor.resume().await {
                    warn!(error = %e, "Failed to resume encode");
                }
                if let Some(job) = self.inner.queue.last_processed() {
                    self.emit(QueueEvent::JobStarted(job));
                }
            }
            debug!("A job is still running; waiting for it before admitting the next");
            return Ok(());
        }

        self.process_next_job().await;
        Ok(())
    }

    /// Stops admitting new jobs. A running job keeps running.
    pub fn pause(&self) {
        self.pause_with(PauseReason::Manual);
    }

    /// Pauses with the given reason if the queue is processing.
    pub fn pause_with(&self, reason: PauseReason) {
        {
            let mut status = self.status();
            if status.state != QueueState::Processing {
                return;
            }
            status.state = QueueState::Paused;
            status.pause_reason = Some(reason);
        }
        info!(%reason, "Queue paused");
        self.emit(QueueEvent::QueuePaused(reason));
    }

    /// Pauses the queue and, when the backend supports it, the running job.
    pub async fn pause_encode(&self) {
        self.pause();

        let executor = &self.inner.executor;
        if executor.supports_pause() && executor.is_encoding() {
            match executor.pause().await {
                Ok(()) => {
                    if let Some(job) = self.inner.queue.last_processed() {
                        if let Err(e) = self.inner.queue.update(&job.id, |job| {
                            job.statistics.paused = true;
                        }) {
                            warn!(job_id = %job.id, error = %e, "Paused job is no longer queued");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to pause encode"),
            }
        }
    }

    /// Pauses the queue and stops the running job.
    ///
    /// The stopped job ends as Error with reason "stopped".
    pub async fn stop(&self) {
        self.pause();
        self.inner.executor.stop().await;
    }

    /// Waits for in-flight job admission and completion handling, including
    /// a running post-queue action.
    pub async fn settle(&self) {
        let _seq = self.inner.sequencing.lock().await;
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Consumes executor events until the queue stops and the executor is idle.
    async fn listen(self, mut rx: mpsc::UnboundedReceiver<ExecutorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ExecutorEvent::Started { job_id } => {
                    debug!(job_id = %job_id, "Executor started job");
                }
                ExecutorEvent::Progress { job_id, progress } => {
                    self.relay_progress(job_id, progress);
                }
                ExecutorEvent::Completed { job_id, outcome } => {
                    let _seq = self.inner.sequencing.lock().await;
                    self.record_completion(&job_id, outcome.clone());
                    if outcome.is_success() {
                        self.process_next_job().await;
                    }
                }
            }

            // A job still InProgress has a completion left to record.
            if !self.is_processing()
                && !self.inner.executor.is_encoding()
                && self.inner.queue.in_progress_count() == 0
            {
                break;
            }
        }
        debug!("Executor listener finished");
    }

    /// Publishes progress only while the job is still InProgress.
    fn relay_progress(&self, job_id: JobId, progress: EncodeProgress) {
        let queue = &self.inner.queue;
        match queue.get(&job_id) {
            Some(job) if job.status == JobStatus::InProgress => {}
            _ => {
                debug!(job_id = %job_id, "Dropping progress for a job that is no longer running");
                return;
            }
        }

        let job_index = queue.position(&job_id).unwrap_or(0);
        self.emit(QueueEvent::ProgressChanged(ProgressSnapshot {
            job_id,
            job_index,
            job_count: queue.len(),
            progress,
        }));
    }

    /// Admits and starts the next Waiting job, or completes the queue.
    ///
    /// Callers hold the sequencing lock.
    async fn process_next_job(&self) {
        if !self.is_processing() {
            return;
        }

        let queue = &self.inner.queue;
        let Some(job) = queue.next_job_for_processing() else {
            if queue.in_progress_count() > 0 {
                debug!("Previous job has not been recorded yet; waiting for its completion");
                return;
            }
            self.finish_queue().await;
            return;
        };

        if self.inner.settings.pause_on_low_disk {
            let dir = job.destination_dir().to_path_buf();
            if let Some(free) = self.inner.probe.free_space(&dir) {
                if free < self.inner.settings.min_free_disk_bytes {
                    warn!(
                        job_id = %job.id,
                        dir = ?dir,
                        free,
                        required = self.inner.settings.min_free_disk_bytes,
                        "Not enough free space to start the next job"
                    );
                    let _ = queue.set_status(&job.id, JobStatus::Waiting, None);
                    self.pause_with(PauseReason::LowDisk);
                    return;
                }
            }
        }

        let job = queue
            .update(&job.id, |job| {
                job.statistics.started_at = Some(current_timestamp_ms());
                job.statistics.finished_at = None;
                job.statistics.final_size_bytes = None;
                job.statistics.paused = false;
            })
            .unwrap_or(job);

        info!(job_id = %job.id, source = ?job.source, destination = ?job.destination, "Starting job");

        match self
            .inner
            .executor
            .start(&job, self.inner.settings.logging_enabled)
            .await
        {
            Ok(()) => self.emit(QueueEvent::JobStarted(job)),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to start job");
                self.record_completion(&job.id, EncodeOutcome::Failed(e.to_string()));
            }
        }
    }

    /// Marks the finished job and applies the fail-stop policy.
    fn record_completion(&self, job_id: &JobId, outcome: EncodeOutcome) {
        let queue = &self.inner.queue;
        let finished_at = current_timestamp_ms();

        let updated = match outcome.error_reason() {
            None => queue.update(job_id, |job| {
                job.set_status(JobStatus::Completed);
                job.statistics.finished_at = Some(finished_at);
                job.statistics.final_size_bytes =
                    std::fs::metadata(&job.destination).ok().map(|m| m.len());
            }),
            Some(reason) => queue.update(job_id, |job| {
                job.fail(&reason);
                job.statistics.finished_at = Some(finished_at);
            }),
        };

        if self.inner.settings.clear_completed_on_finish {
            queue.clear_completed();
        }

        match updated {
            Ok(job) => {
                info!(job_id = %job.id, status = %job.status, "Job finished");
                self.emit(QueueEvent::JobCompleted {
                    success: outcome.is_success(),
                    error: outcome.error_reason(),
                    job,
                });
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Finished job is no longer queued"),
        }

        if let EncodeOutcome::Failed(_) = outcome {
            self.fail_stop();
        }
    }

    /// Pauses with JobError, overriding any other pause reason.
    fn fail_stop(&self) {
        {
            let mut status = self.status();
            if status.state == QueueState::Completed || status.state == QueueState::Idle {
                return;
            }
            status.state = QueueState::Paused;
            status.pause_reason = Some(PauseReason::JobError);
        }
        warn!("Job failed; queue paused");
        self.emit(QueueEvent::QueuePaused(PauseReason::JobError));
    }

    async fn finish_queue(&self) {
        {
            let mut status = self.status();
            status.state = QueueState::Completed;
            status.pause_reason = None;
        }
        info!("Queue completed");
        self.emit(QueueEvent::QueueCompleted);

        match self.inner.settings.post_queue_action {
            PostQueueAction::None => {}
            PostQueueAction::QuitApp => self.emit(QueueEvent::QuitRequested),
            action => {
                let host = self.inner.host.clone();
                let result =
                    tokio::task::spawn_blocking(move || host.run_post_queue_action(action)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(?action, error = %e, "Post-queue action failed"),
                    Err(e) => warn!(?action, error = %e, "Post-queue action panicked"),
                }
            }
        }
    }
}
