//! In-memory doubles for the queue's seams.
//!
//! Compiled for unit tests and behind the `testing` feature, which the
//! integration tests under `tests/` and downstream test suites enable.

use crate::executor::{
    EncodeEngine, EncodeExecutor, EncodeOutcome, EngineEvent, EngineJob, EventSink, ExecutorError,
    ExecutorEvent,
};
use crate::health::{BatteryStatus, SystemProbe};
use crate::host::{HostControl, HostError};
use crate::job::{Job, JobId};
use crate::progress::{EncodeProgress, EngineProgress};
use crate::snapshot::ProcessLiveness;
use async_trait::async_trait;
use encode_queue_config::PostQueueAction;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Liveness oracle with a fixed set of running pids.
#[derive(Debug, Default)]
pub struct FixedLiveness {
    alive: HashSet<u32>,
}

impl FixedLiveness {
    pub fn new(alive: Vec<u32>) -> Self {
        Self {
            alive: alive.into_iter().collect(),
        }
    }
}

impl ProcessLiveness for FixedLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

#[derive(Debug, Default)]
struct HostRecord {
    inhibited: bool,
    inhibit_calls: usize,
    actions: Vec<PostQueueAction>,
}

/// Host control that records calls instead of touching the system.
#[derive(Debug, Default)]
pub struct RecordingHost {
    record: Mutex<HostRecord>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inhibited(&self) -> bool {
        lock(&self.record).inhibited
    }

    pub fn inhibit_calls(&self) -> usize {
        lock(&self.record).inhibit_calls
    }

    /// Post-queue actions run so far, in order.
    pub fn actions(&self) -> Vec<PostQueueAction> {
        lock(&self.record).actions.clone()
    }
}

impl HostControl for RecordingHost {
    fn inhibit_sleep(&self) {
        let mut record = lock(&self.record);
        record.inhibited = true;
        record.inhibit_calls += 1;
    }

    fn allow_sleep(&self) {
        lock(&self.record).inhibited = false;
    }

    fn run_post_queue_action(&self, action: PostQueueAction) -> Result<(), HostError> {
        lock(&self.record).actions.push(action);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProbeReadings {
    battery: Option<BatteryStatus>,
    free_space: BTreeMap<PathBuf, u64>,
}

/// Probe returning scripted readings. Unknown directories report `None`.
#[derive(Debug, Default)]
pub struct MockProbe {
    readings: Mutex<ProbeReadings>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_battery(&self, battery: Option<BatteryStatus>) {
        lock(&self.readings).battery = battery;
    }

    /// Sets the free space reported for `dir` and everything below it.
    pub fn set_free_space(&self, dir: impl AsRef<Path>, bytes: u64) {
        lock(&self.readings)
            .free_space
            .insert(dir.as_ref().to_path_buf(), bytes);
    }
}

impl SystemProbe for MockProbe {
    fn battery(&self) -> Option<BatteryStatus> {
        lock(&self.readings).battery
    }

    fn free_space(&self, dir: &Path) -> Option<u64> {
        let readings = lock(&self.readings);
        dir.ancestors()
            .find_map(|ancestor| readings.free_space.get(ancestor).copied())
    }
}

#[derive(Debug, Default)]
struct EngineState {
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    started: Vec<EngineJob>,
    fail_next_start: Option<String>,
    pause_calls: usize,
    stop_calls: usize,
}

/// Scripted in-process engine.
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<EngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_jobs(&self) -> Vec<EngineJob> {
        lock(&self.state).started.clone()
    }

    /// Makes the next `start_encode` call fail with `reason`.
    pub fn fail_next_start(&self, reason: &str) {
        lock(&self.state).fail_next_start = Some(reason.to_string());
    }

    pub fn emit_progress(&self, progress: EngineProgress) {
        if let Some(tx) = lock(&self.state).events.as_ref() {
            let _ = tx.send(EngineEvent::Progress(progress));
        }
    }

    /// Reports completion of the running job, failed when `error` is set.
    pub fn complete(&self, error: Option<String>) {
        if let Some(tx) = lock(&self.state).events.take() {
            let _ = tx.send(EngineEvent::Completed { error });
        }
    }

    /// Drops the event channel without reporting completion.
    pub fn drop_channel(&self) {
        lock(&self.state).events = None;
    }

    pub fn pause_calls(&self) -> usize {
        lock(&self.state).pause_calls
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.state).stop_calls
    }
}

#[async_trait]
impl EncodeEngine for MockEngine {
    async fn start_encode(
        &self,
        job: EngineJob,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<(), ExecutorError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_next_start.take() {
            return Err(ExecutorError::Engine(reason));
        }
        state.started.push(job);
        state.events = Some(events);
        Ok(())
    }

    async fn pause_encode(&self) -> Result<(), ExecutorError> {
        lock(&self.state).pause_calls += 1;
        Ok(())
    }

    async fn resume_encode(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn stop_encode(&self) {
        lock(&self.state).stop_calls += 1;
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    current: Option<JobId>,
    started: Vec<JobId>,
    fail_next_start: Option<String>,
    supports_pause: bool,
    paused: bool,
}

/// Executor whose jobs finish only when the test says so.
///
/// `stop` completes the running job as [`EncodeOutcome::Stopped`].
#[derive(Debug, Default)]
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
    events: EventSink,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every job started, in order.
    pub fn started_jobs(&self) -> Vec<JobId> {
        lock(&self.state).started.clone()
    }

    pub fn fail_next_start(&self, reason: &str) {
        lock(&self.state).fail_next_start = Some(reason.to_string());
    }

    pub fn set_supports_pause(&self, supported: bool) {
        lock(&self.state).supports_pause = supported;
    }

    /// Finishes the running job. Returns `false` when nothing was running.
    pub fn complete(&self, outcome: EncodeOutcome) -> bool {
        let job_id = {
            let mut state = lock(&self.state);
            state.paused = false;
            state.current.take()
        };
        match job_id {
            Some(job_id) => {
                self.events.emit(ExecutorEvent::Completed { job_id, outcome });
                true
            }
            None => false,
        }
    }

    /// Emits a progress event for `job_id` at `percent`.
    pub fn emit_progress(&self, job_id: &JobId, percent: f32) {
        self.events.emit(ExecutorEvent::Progress {
            job_id: job_id.clone(),
            progress: EncodeProgress {
                pass: 1,
                pass_count: 1,
                percent,
                current_rate: None,
                average_rate: None,
                eta: None,
                elapsed: Duration::ZERO,
                status_unavailable: false,
            },
        });
    }
}

#[async_trait]
impl EncodeExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, job: &Job, _logging_enabled: bool) -> Result<(), ExecutorError> {
        {
            let mut state = lock(&self.state);
            if state.current.is_some() {
                return Err(ExecutorError::AlreadyEncoding);
            }
            if let Some(reason) = state.fail_next_start.take() {
                return Err(ExecutorError::Engine(reason));
            }
            state.current = Some(job.id.clone());
            state.started.push(job.id.clone());
        }
        self.events.emit(ExecutorEvent::Started {
            job_id: job.id.clone(),
        });
        Ok(())
    }

    async fn stop(&self) {
        self.complete(EncodeOutcome::Stopped);
    }

    fn is_encoding(&self) -> bool {
        lock(&self.state).current.is_some()
    }

    fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    fn supports_pause(&self) -> bool {
        lock(&self.state).supports_pause
    }

    async fn pause(&self) -> Result<(), ExecutorError> {
        let mut state = lock(&self.state);
        if !state.supports_pause {
            return Err(ExecutorError::Unsupported {
                backend: "mock",
                operation: "pause",
            });
        }
        if state.current.is_none() {
            return Err(ExecutorError::NotEncoding);
        }
        state.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), ExecutorError> {
        let mut state = lock(&self.state);
        if state.current.is_none() {
            return Err(ExecutorError::NotEncoding);
        }
        state.paused = false;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        self.events.subscribe()
    }
}
