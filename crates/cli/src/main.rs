//! CLI entry point for the encode queue
//!
//! Loads configuration, recovers unfinished jobs from earlier runs, queues
//! jobs from a JSON file and processes the queue until it completes, fails
//! or is interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use encode_queue::{
    build_executor, run_startup_checks, Config, HealthSettings, HostProbe, Job, JobQueue,
    OrchestratorSettings, PauseReason, QueueError, QueueEvent, QueueOrchestrator, SnapshotStore,
    SystemHealthMonitor, SystemHost,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "encode-queue.toml";
const STOP_GRACE: Duration = Duration::from_secs(15);

/// Encode Queue - sequential video encoding with crash recovery
#[derive(Parser, Debug)]
#[command(name = "encode-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// JSON file with jobs to queue: [{"source", "destination", "configuration"}]
    #[arg(short, long)]
    jobs: Option<PathBuf>,

    /// Skip startup checks (encoder availability, state directory)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Do not restore jobs left behind by earlier runs
    #[arg(long, default_value = "false")]
    no_recover: bool,
}

/// One entry of the jobs file.
#[derive(Debug, Deserialize)]
struct JobEntry {
    source: PathBuf,
    destination: PathBuf,
    #[serde(default)]
    configuration: serde_json::Value,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        info!("No {} found; using defaults", DEFAULT_CONFIG);
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }
    Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

/// Queues every job in `path`, skipping duplicate destinations.
fn submit_jobs(queue: &JobQueue, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read jobs file {}", path.display()))?;
    let entries: Vec<JobEntry> = serde_json::from_str(&content)
        .with_context(|| format!("invalid jobs file {}", path.display()))?;

    let mut submitted = 0;
    for entry in entries {
        let job = Job::new(entry.source, entry.destination, entry.configuration);
        match queue.submit(job) {
            Ok(()) => submitted += 1,
            Err(QueueError::DuplicateDestination(dest)) => {
                warn!(destination = ?dest, "Skipping job: destination already queued");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(submitted)
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args.config)?;

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(&config).context("startup checks failed")?;
    }

    let state_dir = config.state_dir();
    info!(state_dir = ?state_dir, backend = ?config.encoder.backend, "Encode queue starting");

    let store = Arc::new(SnapshotStore::new(state_dir));
    let queue = Arc::new(JobQueue::with_snapshots(store.clone()));

    if !args.no_recover {
        let restored = store.recover_into(&queue);
        if restored > 0 {
            info!(restored, "Recovered jobs from an earlier run");
        }
    }

    if let Some(path) = &args.jobs {
        let submitted = submit_jobs(&queue, path)?;
        info!(submitted, "Queued jobs");
    }

    if queue.waiting_count() == 0 {
        info!("Nothing to encode");
        release_snapshot(&queue, &store)?;
        return Ok(ExitCode::SUCCESS);
    }

    let host = Arc::new(SystemHost::new());
    let executor = build_executor(&config, host.clone(), None)?;
    let probe = Arc::new(HostProbe::new());
    let orchestrator = QueueOrchestrator::new(
        queue.clone(),
        executor,
        host,
        probe.clone(),
        OrchestratorSettings::from_config(&config),
    );
    let mut events = orchestrator.subscribe();

    let monitor = Arc::new(SystemHealthMonitor::new(
        orchestrator.clone(),
        probe,
        HealthSettings::from_config(&config),
    ));
    let cancel = CancellationToken::new();
    let health = monitor.spawn(cancel.clone());

    orchestrator.start().await?;

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; stopping the running job");
                orchestrator.stop().await;
                wait_for_idle(&orchestrator, &mut events).await;
                break ExitCode::from(130);
            }
            event = events.recv() => match event {
                Ok(QueueEvent::JobStarted(job)) => {
                    info!(job_id = %job.id, source = ?job.source, destination = ?job.destination, "Encoding");
                }
                Ok(QueueEvent::ProgressChanged(snapshot)) => {
                    let p = &snapshot.progress;
                    debug!(
                        job = snapshot.job_index + 1,
                        of = snapshot.job_count,
                        pass = p.pass,
                        passes = p.pass_count,
                        percent = %format!("{:.2}", p.percent),
                        fps = ?p.current_rate,
                        eta = ?p.eta,
                        "Progress"
                    );
                }
                Ok(QueueEvent::JobCompleted { job, success: true, .. }) => {
                    info!(job_id = %job.id, size = ?job.statistics.final_size_bytes, "Job completed");
                }
                Ok(QueueEvent::JobCompleted { job, error, .. }) => {
                    error!(job_id = %job.id, reason = ?error, "Job failed");
                }
                Ok(QueueEvent::QueuePaused(PauseReason::JobError)) => {
                    error!("Queue paused after a failed job");
                    break ExitCode::FAILURE;
                }
                Ok(QueueEvent::QueuePaused(reason)) => {
                    warn!(%reason, "Queue paused; waiting");
                }
                Ok(QueueEvent::QueueCompleted) => {
                    info!("All jobs finished");
                    break ExitCode::SUCCESS;
                }
                Ok(QueueEvent::QuitRequested) => break ExitCode::SUCCESS,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Dropped queue events");
                }
                Err(broadcast::error::RecvError::Closed) => break ExitCode::FAILURE,
            }
        }
    };

    cancel.cancel();
    let _ = health.await;
    orchestrator.settle().await;
    release_snapshot(&queue, &store)?;

    Ok(code)
}

/// Deletes this run's snapshot unless it still holds unfinished jobs.
///
/// Failed jobs count as unfinished so a later run can retry them.
fn release_snapshot(queue: &JobQueue, store: &SnapshotStore) -> Result<()> {
    let unfinished = queue.unfinished_count();
    if unfinished == 0 {
        store.delete_own()?;
    } else {
        info!(unfinished, "Unfinished jobs kept for the next run");
    }
    Ok(())
}

/// Waits for the stopped job's completion to be recorded.
async fn wait_for_idle(
    orchestrator: &QueueOrchestrator,
    events: &mut broadcast::Receiver<QueueEvent>,
) {
    let wait = async {
        while orchestrator.executor().is_encoding() {
            match events.recv().await {
                Ok(QueueEvent::JobCompleted { .. }) => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(STOP_GRACE, wait).await.is_err() {
        warn!("Encoder did not stop in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encode_queue::testing::FixedLiveness;
    use encode_queue::JobStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(temp: &TempDir) -> Arc<SnapshotStore> {
        Arc::new(SnapshotStore::with_identity(
            temp.path(),
            4242,
            Arc::new(FixedLiveness::default()),
        ))
    }

    #[test]
    fn test_snapshot_with_failed_job_survives_exit() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        let queue = JobQueue::with_snapshots(store.clone());
        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(null));
        let id = job.id.clone();
        queue.submit(job).unwrap();
        queue.set_status(&id, JobStatus::Error, Some("exit code 1")).unwrap();
        assert_eq!(queue.waiting_count(), 0);

        release_snapshot(&queue, &store).unwrap();
        assert!(store.own_path().exists());
    }

    #[test]
    fn test_snapshot_of_finished_run_is_deleted() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        let queue = JobQueue::with_snapshots(store.clone());
        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(null));
        let id = job.id.clone();
        queue.submit(job).unwrap();
        queue.set_status(&id, JobStatus::Completed, None).unwrap();

        release_snapshot(&queue, &store).unwrap();
        assert!(!store.own_path().exists());
    }

    #[test]
    fn test_jobs_file_skips_duplicates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"[
                {"source": "/in/a.mkv", "destination": "/out/a.mp4"},
                {"source": "/in/b.mkv", "destination": "/out/./a.mp4"},
                {"source": "/in/c.mkv", "destination": "/out/c.mp4", "configuration": ["-q", "20"]}
            ]"#,
        )
        .unwrap();

        let queue = JobQueue::new();
        assert_eq!(submit_jobs(&queue, &path).unwrap(), 2);
        assert_eq!(queue.len(), 2);
    }
}
