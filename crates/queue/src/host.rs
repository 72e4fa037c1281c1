//! Host operating-system integration: sleep inhibition and post-queue actions.

use encode_queue_config::PostQueueAction;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for host operations
#[derive(Debug, Error)]
pub enum HostError {
    /// Failed to launch a host command
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Host command exited unsuccessfully
    #[error("{command} exited with status {status}")]
    CommandFailed { command: String, status: String },
}

/// Control over host power state.
///
/// `inhibit_sleep` and `allow_sleep` are idempotent.
pub trait HostControl: Send + Sync {
    fn inhibit_sleep(&self);
    fn allow_sleep(&self);
    fn run_post_queue_action(&self, action: PostQueueAction) -> Result<(), HostError>;
}

/// Host control that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl HostControl for NoopHost {
    fn inhibit_sleep(&self) {}

    fn allow_sleep(&self) {}

    fn run_post_queue_action(&self, _action: PostQueueAction) -> Result<(), HostError> {
        Ok(())
    }
}

/// Linux host control through systemd.
///
/// Sleep is inhibited by keeping a `systemd-inhibit` child alive; post-queue
/// actions go through `systemctl` and `loginctl`.
#[derive(Debug, Default)]
pub struct SystemHost {
    inhibitor: Mutex<Option<Child>>,
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inhibiting(&self) -> bool {
        self.inhibitor
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

impl HostControl for SystemHost {
    fn inhibit_sleep(&self) {
        let mut guard = self
            .inhibitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop a handle whose inhibitor has already exited.
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => return,
                _ => *guard = None,
            }
        }

        let spawned = Command::new("systemd-inhibit")
            .args([
                "--what=sleep:idle",
                "--who=encode-queue",
                "--why=Encoding in progress",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                debug!(pid = child.id(), "Sleep inhibited");
                *guard = Some(child);
            }
            Err(e) => warn!(error = %e, "Failed to inhibit sleep"),
        }
    }

    fn allow_sleep(&self) {
        let mut guard = self
            .inhibitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
            debug!("Sleep inhibition released");
        }
    }

    fn run_post_queue_action(&self, action: PostQueueAction) -> Result<(), HostError> {
        let argv: Vec<String> = match action {
            PostQueueAction::None | PostQueueAction::QuitApp => return Ok(()),
            PostQueueAction::Shutdown => command_line(&["systemctl", "poweroff"]),
            PostQueueAction::Sleep => command_line(&["systemctl", "suspend"]),
            PostQueueAction::Hibernate => command_line(&["systemctl", "hibernate"]),
            PostQueueAction::Lock => command_line(&["loginctl", "lock-session"]),
            PostQueueAction::LogOff => match std::env::var("XDG_SESSION_ID") {
                Ok(session) if !session.is_empty() => {
                    command_line(&["loginctl", "terminate-session", &session])
                }
                _ => {
                    let user = std::env::var("USER").unwrap_or_default();
                    command_line(&["loginctl", "terminate-user", &user])
                }
            },
        };
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();

        info!(?action, command = %argv.join(" "), "Running post-queue action");
        run_command(&argv)
    }
}

impl Drop for SystemHost {
    fn drop(&mut self) {
        self.allow_sleep();
    }
}

fn command_line(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn run_command(argv: &[&str]) -> Result<(), HostError> {
    let command = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .map_err(|source| HostError::Spawn {
            command: command.clone(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(HostError::CommandFailed {
            command,
            status: status.to_string(),
        })
    }
}
