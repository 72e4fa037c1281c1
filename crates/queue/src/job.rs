//! Job model for queued encode requests.
//!
//! A job is created fully formed by the submitter: source, destination and an
//! opaque configuration payload that only the executor backends interpret.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique job identifier (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Engine configuration payload; opaque to the queue.
pub type EncodeConfiguration = serde_json::Value;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the queue.
    #[default]
    Waiting,
    /// Job is currently encoding.
    InProgress,
    /// Job finished successfully.
    Completed,
    /// Job failed, was stopped, or could not be started.
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Timing and output details recorded while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Unix timestamp (milliseconds) when the encode started.
    pub started_at: Option<i64>,
    /// Unix timestamp (milliseconds) when the encode finished.
    pub finished_at: Option<i64>,
    /// Size of the output file after a successful encode.
    pub final_size_bytes: Option<u64>,
    /// Whether the encode was paused at any point.
    #[serde(default)]
    pub paused: bool,
}

impl JobStatistics {
    /// Wall-clock duration of the encode, if it has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// A single queued transcode request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub configuration: EncodeConfiguration,
    #[serde(default)]
    pub status: JobStatus,
    /// Short reason shown alongside Status=Error.
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub statistics: JobStatistics,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the job was last updated.
    pub updated_at: i64,
}

impl Job {
    /// Creates a Waiting job with a fresh id.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        configuration: EncodeConfiguration,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: JobId::new(),
            source: source.into(),
            destination: destination.into(),
            configuration,
            status: JobStatus::Waiting,
            error_reason: None,
            statistics: JobStatistics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set the job status and update timestamp.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        if status != JobStatus::Error {
            self.error_reason = None;
        }
        self.touch();
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Error;
        self.error_reason = Some(reason.to_string());
        self.touch();
    }

    /// Check if the job is in a terminal state (completed or error).
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Error)
    }

    /// Check if the job is active (waiting or in progress).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Waiting | JobStatus::InProgress)
    }

    /// Directory the output file is written into.
    pub fn destination_dir(&self) -> &Path {
        match self.destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
