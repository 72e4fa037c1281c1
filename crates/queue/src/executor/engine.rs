//! In-process engine backend.
//!
//! Wraps a long-lived [`EncodeEngine`] handle. Engine progress and
//! completion callbacks arrive on a channel and are re-raised as executor
//! events with elapsed time stamped. Cancellation is cooperative: `stop`
//! signals the engine and the job ends when the engine reports completion.

use super::{EncodeExecutor, EncodeOutcome, EventSink, ExecutorError, ExecutorEvent};
use crate::host::HostControl;
use crate::job::{EncodeConfiguration, Job, JobId};
use crate::progress::{EngineProgress, ProgressParser};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The engine's native job representation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineJob {
    pub job_id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub configuration: EncodeConfiguration,
}

impl From<&Job> for EngineJob {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            configuration: job.configuration.clone(),
        }
    }
}

/// Callbacks raised by the engine while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress(EngineProgress),
    /// The job finished; `error` is set when it failed.
    Completed { error: Option<String> },
}

/// Entry points of an in-process encoding engine.
#[async_trait]
pub trait EncodeEngine: Send + Sync {
    /// Starts encoding `job`, reporting through `events`.
    async fn start_encode(
        &self,
        job: EngineJob,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<(), ExecutorError>;

    async fn pause_encode(&self) -> Result<(), ExecutorError>;

    async fn resume_encode(&self) -> Result<(), ExecutorError>;

    /// Asks the engine to stop; completion is still reported via `events`.
    async fn stop_encode(&self);
}

/// Executor driving an in-process engine handle.
pub struct EngineExecutor {
    engine: Arc<dyn EncodeEngine>,
    host: Arc<dyn HostControl>,
    prevent_sleep: bool,
    events: Arc<EventSink>,
    encoding: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl EngineExecutor {
    pub fn new(engine: Arc<dyn EncodeEngine>, host: Arc<dyn HostControl>, prevent_sleep: bool) -> Self {
        Self {
            engine,
            host,
            prevent_sleep,
            events: Arc::new(EventSink::default()),
            encoding: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl EncodeExecutor for EngineExecutor {
    fn name(&self) -> &'static str {
        "engine"
    }

    async fn start(&self, job: &Job, _logging_enabled: bool) -> Result<(), ExecutorError> {
        if self
            .encoding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExecutorError::AlreadyEncoding);
        }
        self.paused.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.engine.start_encode(EngineJob::from(job), tx).await {
            self.encoding.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(job_id = %job.id, source = ?job.source, "Engine encode started");
        if self.prevent_sleep {
            self.host.inhibit_sleep();
        }
        self.events.emit(ExecutorEvent::Started {
            job_id: job.id.clone(),
        });

        let relay = EngineRelay {
            job_id: job.id.clone(),
            started: Instant::now(),
            events: self.events.clone(),
            host: self.host.clone(),
            prevent_sleep: self.prevent_sleep,
            encoding: self.encoding.clone(),
            paused: self.paused.clone(),
            stop_requested: self.stop_requested.clone(),
        };
        tokio::spawn(relay.run(rx));

        Ok(())
    }

    async fn stop(&self) {
        if !self.encoding.load(Ordering::SeqCst) {
            return;
        }
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("Stopping engine encode");
            self.engine.stop_encode().await;
        }
    }

    fn is_encoding(&self) -> bool {
        self.encoding.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn supports_pause(&self) -> bool {
        true
    }

    async fn pause(&self) -> Result<(), ExecutorError> {
        if !self.is_encoding() {
            return Err(ExecutorError::NotEncoding);
        }
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.pause_encode().await?;
        self.paused.store(true, Ordering::SeqCst);
        info!("Engine encode paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), ExecutorError> {
        if !self.is_encoding() {
            return Err(ExecutorError::NotEncoding);
        }
        if !self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.resume_encode().await?;
        self.paused.store(false, Ordering::SeqCst);
        info!("Engine encode resumed");
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        self.events.subscribe()
    }
}

struct EngineRelay {
    job_id: JobId,
    started: Instant,
    events: Arc<EventSink>,
    host: Arc<dyn HostControl>,
    prevent_sleep: bool,
    encoding: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl EngineRelay {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        let parser = ProgressParser::new();

        let error = loop {
            match rx.recv().await {
                Some(EngineEvent::Progress(progress)) => {
                    self.events.emit(ExecutorEvent::Progress {
                        job_id: self.job_id.clone(),
                        progress: parser
                            .from_engine(&progress)
                            .with_elapsed(self.started.elapsed()),
                    });
                }
                Some(EngineEvent::Completed { error }) => break error,
                None => break Some("engine ended without reporting completion".to_string()),
            }
        };

        let outcome = if self.stop_requested.load(Ordering::SeqCst) {
            EncodeOutcome::Stopped
        } else {
            match error {
                None => EncodeOutcome::Success,
                Some(reason) => {
                    warn!(job_id = %self.job_id, reason = %reason, "Engine encode failed");
                    EncodeOutcome::Failed(reason)
                }
            }
        };

        if self.prevent_sleep {
            self.host.allow_sleep();
        }
        self.paused.store(false, Ordering::SeqCst);
        self.encoding.store(false, Ordering::SeqCst);

        self.events.emit(ExecutorEvent::Completed {
            job_id: self.job_id,
            outcome,
        });
    }
}
