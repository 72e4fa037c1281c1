//! Encode executors.
//!
//! An executor owns the lifecycle of a single running job against the
//! encoding engine. Two backends implement [`EncodeExecutor`]: the
//! [`ProcessExecutor`] spawns the encoder as an external process, and the
//! [`EngineExecutor`] drives a long-lived in-process [`EncodeEngine`] handle.
//! The backend is chosen once at construction by [`build_executor`].

mod engine;
mod log;
mod process;

pub use engine::{EncodeEngine, EngineEvent, EngineExecutor, EngineJob};
pub use log::ActivityLog;
pub use process::{
    build_encode_command, ArgumentBuilder, ProcessExecutor, ProcessSettings, TemplateArguments,
};

use crate::host::HostControl;
use crate::job::{Job, JobId};
use crate::progress::EncodeProgress;
use async_trait::async_trait;
use encode_queue_config::{Config, EncoderBackend};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for executor operations
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A job is already running on this executor
    #[error("An encode is already in progress")]
    AlreadyEncoding,

    /// No job is running
    #[error("No encode is in progress")]
    NotEncoding,

    /// The encoder process could not be started
    #[error("Failed to start encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The job's configuration could not be turned into encoder arguments
    #[error("Invalid encode configuration: {0}")]
    Arguments(String),

    /// The in-process engine reported a failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// The backend does not support the requested operation
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The activity log could not be prepared
    #[error("Failed to set up activity log: {0}")]
    LogSetup(#[source] std::io::Error),
}

/// How a started job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Success,
    /// Abnormal exit or engine-reported error, with a short reason.
    Failed(String),
    /// Ended by [`EncodeExecutor::stop`].
    Stopped,
}

impl EncodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EncodeOutcome::Success)
    }

    /// Reason string for a job marked Error, if any.
    pub fn error_reason(&self) -> Option<String> {
        match self {
            EncodeOutcome::Success => None,
            EncodeOutcome::Failed(reason) => Some(reason.clone()),
            EncodeOutcome::Stopped => Some("stopped".to_string()),
        }
    }
}

/// Events raised by an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Started { job_id: JobId },
    Progress { job_id: JobId, progress: EncodeProgress },
    /// Raised exactly once per started job.
    Completed { job_id: JobId, outcome: EncodeOutcome },
}

/// Contract shared by both backends.
///
/// `start` fails with [`ExecutorError::AlreadyEncoding`] while a job runs and
/// leaves the executor idle when it fails for any reason. `stop` is
/// idempotent and safe to call when nothing is running.
#[async_trait]
pub trait EncodeExecutor: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn start(&self, job: &Job, logging_enabled: bool) -> Result<(), ExecutorError>;

    async fn stop(&self);

    fn is_encoding(&self) -> bool;

    fn is_paused(&self) -> bool {
        false
    }

    fn supports_pause(&self) -> bool {
        false
    }

    async fn pause(&self) -> Result<(), ExecutorError> {
        Err(ExecutorError::Unsupported {
            backend: self.name(),
            operation: "pause",
        })
    }

    async fn resume(&self) -> Result<(), ExecutorError> {
        Err(ExecutorError::Unsupported {
            backend: self.name(),
            operation: "resume",
        })
    }

    /// Subscribes to executor events, replacing any previous subscriber.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent>;

    /// Captured diagnostic output of the current or last job.
    fn activity_log(&self) -> String {
        String::new()
    }
}

/// Single-subscriber event channel shared by executor tasks.
#[derive(Debug, Default)]
pub(crate) struct EventSink {
    sender: Mutex<Option<mpsc::UnboundedSender<ExecutorEvent>>>,
}

impl EventSink {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ExecutorEvent) {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Builds the executor selected by `config.encoder.backend`.
///
/// The engine backend needs an engine handle; the process backend ignores it.
pub fn build_executor(
    config: &Config,
    host: Arc<dyn HostControl>,
    engine: Option<Arc<dyn EncodeEngine>>,
) -> Result<Arc<dyn EncodeExecutor>, ExecutorError> {
    match config.encoder.backend {
        EncoderBackend::Process => Ok(Arc::new(ProcessExecutor::new(
            ProcessSettings::from_config(config),
            Arc::new(TemplateArguments),
            host,
        ))),
        EncoderBackend::Engine => {
            let engine = engine.ok_or_else(|| {
                ExecutorError::Engine("no in-process engine is available".to_string())
            })?;
            Ok(Arc::new(EngineExecutor::new(
                engine,
                host,
                config.encoder.prevent_sleep,
            )))
        }
    }
}
