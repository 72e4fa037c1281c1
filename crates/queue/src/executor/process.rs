//! Process backend: runs the encoder as an external OS process.
//!
//! Standard output is read by a cancellable task and fed through
//! [`LineDecoder`] and [`ProgressParser`]. When logging is enabled, standard
//! error goes to the [`ActivityLog`]. An exit watcher owns the child, waits
//! for it (or kills it on stop), waits a bounded time for the log reader to
//! drain, and raises `Completed` exactly once.

use super::log::ActivityLog;
use super::{EncodeExecutor, EncodeOutcome, EventSink, ExecutorError, ExecutorEvent};
use crate::host::HostControl;
use crate::job::{Job, JobId};
use crate::progress::{EncodeProgress, LineDecoder, ProgressParser};
use async_trait::async_trait;
use encode_queue_config::{Config, ProcessPriority};
use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Arguments used when a job carries no configuration payload.
const DEFAULT_ARGS: &[&str] = &["-i", "{source}", "-o", "{destination}"];

/// Turns a job's opaque configuration into encoder arguments.
pub trait ArgumentBuilder: Send + Sync {
    fn build(&self, job: &Job) -> Result<Vec<String>, ExecutorError>;
}

/// Default argument builder.
///
/// Accepts a JSON array of strings or a single whitespace-separated string,
/// substituting `{source}` and `{destination}`. A null configuration yields
/// `-i {source} -o {destination}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateArguments;

impl ArgumentBuilder for TemplateArguments {
    fn build(&self, job: &Job) -> Result<Vec<String>, ExecutorError> {
        let template: Vec<String> = match &job.configuration {
            Value::Null => DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ExecutorError::Arguments(format!("non-string argument {}", item))
                    })
                })
                .collect::<Result<_, _>>()?,
            other => {
                return Err(ExecutorError::Arguments(format!(
                    "expected an argument list, got {}",
                    other
                )))
            }
        };

        let source = job.source.to_string_lossy();
        let destination = job.destination.to_string_lossy();
        Ok(template
            .into_iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{destination}", &destination)
            })
            .collect())
    }
}

/// Settings for the process backend.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub executable: PathBuf,
    pub priority: ProcessPriority,
    /// Directory for `encode_<pid>.log`; `None` keeps the log in memory only.
    pub log_dir: Option<PathBuf>,
    pub max_log_bytes: u64,
    pub drain_timeout: Duration,
    pub prevent_sleep: bool,
}

impl ProcessSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executable: config.encoder.executable.clone(),
            priority: config.encoder.priority,
            log_dir: Some(config.log_dir()),
            max_log_bytes: config.encoder.max_log_bytes,
            drain_timeout: Duration::from_millis(config.encoder.exit_drain_timeout_ms),
            prevent_sleep: config.encoder.prevent_sleep,
        }
    }
}

/// Build the encoder command for the given arguments
///
/// On Unix a non-default priority is applied by launching through
/// `nice -n <niceness>`.
///
/// # Arguments
/// * `executable` - Encoder executable
/// * `priority` - Scheduling priority hint
/// * `args` - Encoder arguments
///
/// # Returns
/// A configured Command with no stdio set up
pub fn build_encode_command(
    executable: &std::path::Path,
    priority: ProcessPriority,
    args: &[String],
) -> Command {
    let niceness = priority.niceness();

    let mut cmd = if cfg!(unix) && niceness != 0 {
        let mut cmd = Command::new("nice");
        cmd.arg("-n").arg(niceness.to_string()).arg(executable);
        cmd
    } else {
        Command::new(executable)
    };
    cmd.args(args);
    cmd
}

struct ActiveEncode {
    job_id: JobId,
    cancel: CancellationToken,
    stop_requested: Arc<AtomicBool>,
}

/// Executor that supervises an external encoder process.
pub struct ProcessExecutor {
    settings: ProcessSettings,
    arguments: Arc<dyn ArgumentBuilder>,
    host: Arc<dyn HostControl>,
    events: Arc<EventSink>,
    log: Arc<ActivityLog>,
    encoding: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveEncode>>>,
}

impl ProcessExecutor {
    pub fn new(
        settings: ProcessSettings,
        arguments: Arc<dyn ArgumentBuilder>,
        host: Arc<dyn HostControl>,
    ) -> Self {
        let log = Arc::new(ActivityLog::new(settings.max_log_bytes));
        Self {
            settings,
            arguments,
            host,
            events: Arc::new(EventSink::default()),
            log,
            encoding: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    fn spawn_child(&self, job: &Job, logging_enabled: bool) -> Result<Child, ExecutorError> {
        let args = self.arguments.build(job)?;

        // Every job starts from an empty log; only logging jobs get a file.
        let log_dir = if logging_enabled {
            self.settings.log_dir.as_deref()
        } else {
            None
        };
        self.log
            .begin(log_dir, std::process::id())
            .map_err(ExecutorError::LogSetup)?;
        if logging_enabled {
            self.log.append(&format!(
                "# {} {}",
                self.settings.executable.display(),
                args.join(" ")
            ));
        }

        let mut cmd = build_encode_command(&self.settings.executable, self.settings.priority, &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if logging_enabled {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.settings.executable.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl EncodeExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(&self, job: &Job, logging_enabled: bool) -> Result<(), ExecutorError> {
        if self
            .encoding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExecutorError::AlreadyEncoding);
        }

        let mut child = match self.spawn_child(job, logging_enabled) {
            Ok(child) => child,
            Err(e) => {
                self.encoding.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            job_id = %job.id,
            pid = child.id(),
            source = ?job.source,
            destination = ?job.destination,
            "Encoder process started"
        );

        if self.settings.prevent_sleep {
            self.host.inhibit_sleep();
        }

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let log_overflow = Arc::new(AtomicBool::new(false));

        *self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ActiveEncode {
            job_id: job.id.clone(),
            cancel: cancel.clone(),
            stop_requested: stop_requested.clone(),
        });

        self.events.emit(ExecutorEvent::Started {
            job_id: job.id.clone(),
        });

        let mut drained = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(read_progress(
                stdout,
                job.id.clone(),
                started,
                self.events.clone(),
                cancel.clone(),
                done_tx,
            ));
            drained.push(done_rx);
        }

        if let Some(stderr) = child.stderr.take() {
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(read_log(
                stderr,
                self.log.clone(),
                log_overflow.clone(),
                cancel.clone(),
                done_tx,
            ));
            drained.push(done_rx);
        }

        let watcher = ExitWatcher {
            job_id: job.id.clone(),
            child,
            cancel,
            stop_requested,
            log_overflow,
            drained,
            drain_timeout: self.settings.drain_timeout,
            max_log_bytes: self.settings.max_log_bytes,
            prevent_sleep: self.settings.prevent_sleep,
            host: self.host.clone(),
            events: self.events.clone(),
            log: self.log.clone(),
            encoding: self.encoding.clone(),
            active: self.active.clone(),
        };
        tokio::spawn(watcher.run());

        Ok(())
    }

    async fn stop(&self) {
        let guard = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = guard.as_ref() {
            if !active.stop_requested.swap(true, Ordering::SeqCst) {
                info!(job_id = %active.job_id, "Stopping encoder process");
            }
            active.cancel.cancel();
        }
    }

    fn is_encoding(&self) -> bool {
        self.encoding.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutorEvent> {
        self.events.subscribe()
    }

    fn activity_log(&self) -> String {
        self.log.text()
    }
}

/// Reads stdout in chunks until EOF or cancellation, emitting progress.
async fn read_progress<R>(
    mut stdout: R,
    job_id: JobId,
    started: Instant,
    events: Arc<EventSink>,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let parser = ProgressParser::new();
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdout.read(&mut buf) => read,
        };

        let eof = matches!(read, Ok(0));
        let lines = match read {
            Ok(0) => decoder.finish().into_iter().collect(),
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Encoder output stream failed");
                events.emit(ExecutorEvent::Progress {
                    job_id: job_id.clone(),
                    progress: EncodeProgress::unavailable().with_elapsed(started.elapsed()),
                });
                break;
            }
        };

        for line in lines {
            if let Some(progress) = parser.parse_line(&line) {
                events.emit(ExecutorEvent::Progress {
                    job_id: job_id.clone(),
                    progress: progress.with_elapsed(started.elapsed()),
                });
            }
        }

        if eof {
            break;
        }
    }
    let _ = done.send(());
}

/// Appends stderr lines to the activity log until EOF, overflow or
/// cancellation.
async fn read_log<R>(
    stderr: R,
    log: Arc<ActivityLog>,
    overflow: Arc<AtomicBool>,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if !log.append(&line) {
                    overflow.store(true, Ordering::SeqCst);
                    cancel.cancel();
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Encoder log stream ended with error");
                break;
            }
        }
    }
    log.flush();
    let _ = done.send(());
}

struct ExitWatcher {
    job_id: JobId,
    child: Child,
    cancel: CancellationToken,
    stop_requested: Arc<AtomicBool>,
    log_overflow: Arc<AtomicBool>,
    /// One signal per stream reader, sent when it stops reading.
    drained: Vec<oneshot::Receiver<()>>,
    drain_timeout: Duration,
    max_log_bytes: u64,
    prevent_sleep: bool,
    host: Arc<dyn HostControl>,
    events: Arc<EventSink>,
    log: Arc<ActivityLog>,
    encoding: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveEncode>>>,
}

impl ExitWatcher {
    async fn run(mut self) {
        let status = tokio::select! {
            status = self.child.wait() => status,
            _ = self.cancel.cancelled() => {
                // Already-exited processes make kill fail; that is fine.
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        };

        let drained = std::mem::take(&mut self.drained);
        let drain_all = async {
            for reader in drained {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain_all).await.is_err() {
            debug!(job_id = %self.job_id, "Timed out waiting for encoder output to drain");
        }
        self.cancel.cancel();

        let outcome = self.outcome(status);
        match &outcome {
            EncodeOutcome::Success => info!(job_id = %self.job_id, "Encoder process finished"),
            EncodeOutcome::Stopped => info!(job_id = %self.job_id, "Encoder process stopped"),
            EncodeOutcome::Failed(reason) => {
                warn!(job_id = %self.job_id, reason = %reason, "Encoder process failed")
            }
        }

        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if self.prevent_sleep {
            self.host.allow_sleep();
        }
        self.encoding.store(false, Ordering::SeqCst);
        self.log.flush();

        self.events.emit(ExecutorEvent::Completed {
            job_id: self.job_id,
            outcome,
        });
    }

    fn outcome(&self, status: std::io::Result<ExitStatus>) -> EncodeOutcome {
        if self.log_overflow.load(Ordering::SeqCst) {
            return EncodeOutcome::Failed(format!(
                "activity log exceeded {} bytes",
                self.max_log_bytes
            ));
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            return EncodeOutcome::Stopped;
        }
        match status {
            Ok(status) if status.success() => EncodeOutcome::Success,
            Ok(status) => match status.code() {
                Some(code) => EncodeOutcome::Failed(format!("encoder exited with code {}", code)),
                None => EncodeOutcome::Failed("encoder was terminated by a signal".to_string()),
            },
            Err(e) => EncodeOutcome::Failed(format!("failed to wait for encoder: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoopHost;
    use crate::testing::RecordingHost;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings(executable: &str, log_dir: Option<PathBuf>) -> ProcessSettings {
        ProcessSettings {
            executable: PathBuf::from(executable),
            priority: ProcessPriority::Normal,
            log_dir,
            max_log_bytes: 1_000_000,
            drain_timeout: Duration::from_millis(500),
            prevent_sleep: true,
        }
    }

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    async fn next_completed(
        rx: &mut mpsc::UnboundedReceiver<ExecutorEvent>,
    ) -> (Vec<EncodeProgress>, EncodeOutcome) {
        let mut progress = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("executor should finish")
                .expect("channel open");
            match event {
                ExecutorEvent::Progress { progress: p, .. } => progress.push(p),
                ExecutorEvent::Completed { outcome, .. } => return (progress, outcome),
                ExecutorEvent::Started { .. } => {}
            }
        }
    }

    #[test]
    fn test_template_arguments() {
        let job = Job::new(
            "/in/a.mkv",
            "/out/a.mp4",
            json!(["-i", "{source}", "-o", "{destination}", "-e", "x265"]),
        );
        let args = TemplateArguments.build(&job).unwrap();
        assert_eq!(args, vec!["-i", "/in/a.mkv", "-o", "/out/a.mp4", "-e", "x265"]);

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!("-i {source}  -o {destination}"));
        assert_eq!(TemplateArguments.build(&job).unwrap().len(), 4);

        let job = Job::new("/in/a.mkv", "/out/a.mp4", Value::Null);
        assert_eq!(
            TemplateArguments.build(&job).unwrap(),
            vec!["-i", "/in/a.mkv", "-o", "/out/a.mp4"]
        );

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!({"preset": "Fast 1080p30"}));
        assert!(matches!(
            TemplateArguments.build(&job),
            Err(ExecutorError::Arguments(_))
        ));
        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-q", 20]));
        assert!(TemplateArguments.build(&job).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_priority_wraps_with_nice() {
        let args = vec!["-i".to_string(), "in.mkv".to_string()];

        let cmd = build_encode_command(
            std::path::Path::new("HandBrakeCLI"),
            ProcessPriority::BelowNormal,
            &args,
        );
        assert_eq!(cmd.as_std().get_program(), "nice");
        assert_eq!(get_command_args(&cmd), vec!["-n", "10", "HandBrakeCLI", "-i", "in.mkv"]);

        let cmd = build_encode_command(
            std::path::Path::new("HandBrakeCLI"),
            ProcessPriority::Normal,
            &args,
        );
        assert_eq!(cmd.as_std().get_program(), "HandBrakeCLI");
        assert_eq!(get_command_args(&cmd), args);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_success_emits_progress_and_log() {
        let temp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let executor = ProcessExecutor::new(
            settings("sh", Some(temp.path().to_path_buf())),
            Arc::new(TemplateArguments),
            host.clone(),
        );
        let mut rx = executor.subscribe();

        let script = "printf 'Encoding: task 1 of 1, 10.00 %%\\rEncoding: task 1 of 1, 55.50 %% (30.00 fps, avg 29.00 fps, ETA 00h00m05s)\\n'; echo 'muxing done' >&2";
        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", script]));
        executor.start(&job, true).await.unwrap();
        assert!(executor.is_encoding());

        let (progress, outcome) = next_completed(&mut rx).await;
        assert_eq!(outcome, EncodeOutcome::Success);
        assert_eq!(progress.len(), 2);
        assert!((progress[1].percent - 55.5).abs() < 0.001);
        assert_eq!(progress[1].eta, Some(Duration::from_secs(5)));
        assert!(!executor.is_encoding());
        assert!(executor.activity_log().contains("muxing done"));
        assert!(temp.path().join(format!("encode_{}.log", std::process::id())).exists());
        assert_eq!(host.inhibit_calls(), 1);
        assert!(!host.is_inhibited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_job_without_logging_clears_previous_log() {
        let executor = ProcessExecutor::new(
            settings("sh", None),
            Arc::new(TemplateArguments),
            Arc::new(NoopHost),
        );
        let mut rx = executor.subscribe();

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", "echo 'first job' >&2"]));
        executor.start(&job, true).await.unwrap();
        next_completed(&mut rx).await;
        assert!(executor.activity_log().contains("first job"));

        let job = Job::new("/in/b.mkv", "/out/b.mp4", json!(["-c", "echo 'second job' >&2"]));
        executor.start(&job, false).await.unwrap();
        let (_, outcome) = next_completed(&mut rx).await;
        assert_eq!(outcome, EncodeOutcome::Success);
        assert!(executor.activity_log().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_failure_reports_exit_code() {
        let executor = ProcessExecutor::new(
            settings("sh", None),
            Arc::new(TemplateArguments),
            Arc::new(NoopHost),
        );
        let mut rx = executor.subscribe();

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", "exit 3"]));
        executor.start(&job, false).await.unwrap();

        let (_, outcome) = next_completed(&mut rx).await;
        assert_eq!(outcome, EncodeOutcome::Failed("encoder exited with code 3".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_while_encoding_fails() {
        let executor = ProcessExecutor::new(
            settings("sh", None),
            Arc::new(TemplateArguments),
            Arc::new(NoopHost),
        );
        let mut rx = executor.subscribe();

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", "sleep 30"]));
        executor.start(&job, false).await.unwrap();

        let other = Job::new("/in/b.mkv", "/out/b.mp4", json!(["-c", "true"]));
        assert!(matches!(
            executor.start(&other, false).await,
            Err(ExecutorError::AlreadyEncoding)
        ));

        executor.stop().await;
        let (_, outcome) = next_completed(&mut rx).await;
        assert_eq!(outcome, EncodeOutcome::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_idempotent_and_completes_once() {
        let executor = ProcessExecutor::new(
            settings("sh", None),
            Arc::new(TemplateArguments),
            Arc::new(NoopHost),
        );
        let mut rx = executor.subscribe();

        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", "sleep 30"]));
        executor.start(&job, true).await.unwrap();

        executor.stop().await;
        executor.stop().await;
        let (_, outcome) = next_completed(&mut rx).await;
        assert_eq!(outcome, EncodeOutcome::Stopped);

        executor.stop().await;
        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "no second Completed event expected");
        assert!(!executor.is_encoding());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_executor_idle() {
        let executor = ProcessExecutor::new(
            settings("/definitely/not/an/encoder", None),
            Arc::new(TemplateArguments),
            Arc::new(NoopHost),
        );

        let job = Job::new("/in/a.mkv", "/out/a.mp4", Value::Null);
        assert!(matches!(
            executor.start(&job, false).await,
            Err(ExecutorError::Spawn { .. })
        ));
        assert!(!executor.is_encoding());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_overflow_fails_encode() {
        let mut settings = settings("sh", None);
        settings.max_log_bytes = 64;
        let executor =
            ProcessExecutor::new(settings, Arc::new(TemplateArguments), Arc::new(NoopHost));
        let mut rx = executor.subscribe();

        let script = "while true; do echo 'noisy diagnostic line' >&2; done";
        let job = Job::new("/in/a.mkv", "/out/a.mp4", json!(["-c", script]));
        executor.start(&job, true).await.unwrap();

        let (_, outcome) = next_completed(&mut rx).await;
        assert!(matches!(outcome, EncodeOutcome::Failed(reason) if reason.contains("exceeded")));
    }
}
