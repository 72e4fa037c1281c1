//! Encode Queue
//!
//! Sequential video-encode queue: job bookkeeping, the orchestration state
//! machine, encoder executors, crash-recovery snapshots and health gating.

pub mod executor;
pub mod health;
pub mod host;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod snapshot;
pub mod startup;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use encode_queue_config as config;
pub use encode_queue_config::Config;
pub use executor::{
    build_encode_command, build_executor, ActivityLog, ArgumentBuilder, EncodeEngine,
    EncodeExecutor, EncodeOutcome, EngineEvent, EngineExecutor, EngineJob, ExecutorError,
    ExecutorEvent, ProcessExecutor, ProcessSettings, TemplateArguments,
};
pub use health::{BatteryStatus, HealthSettings, HostProbe, SystemHealthMonitor, SystemProbe};
pub use host::{HostControl, HostError, NoopHost, SystemHost};
pub use job::{current_timestamp_ms, EncodeConfiguration, Job, JobId, JobStatistics, JobStatus};
pub use orchestrator::{
    OrchestratorSettings, PauseReason, ProgressSnapshot, QueueEvent, QueueOrchestrator, QueueState,
};
pub use progress::{parse_eta, EncodeProgress, EngineProgress, LineDecoder, ProgressParser};
pub use queue::{normalize_destination, JobQueue, QueueError};
pub use snapshot::{
    DiscoveredSnapshot, ProcessLiveness, SnapshotError, SnapshotFile, SnapshotStore,
    SysinfoLiveness,
};
pub use startup::{
    check_encoder_available, check_state_dir_writable, parse_encoder_version, run_startup_checks,
    StartupError,
};
