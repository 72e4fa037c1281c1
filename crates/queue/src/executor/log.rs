//! Activity log for encoder diagnostic output.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TAIL_LINES: usize = 500;

#[derive(Debug, Default)]
struct LogState {
    file: Option<File>,
    path: Option<PathBuf>,
    tail: VecDeque<String>,
    bytes: u64,
}

/// Captures encoder diagnostics into a per-process log file and an
/// in-memory tail.
///
/// The log is reset at the start of every job. Once the byte count passes
/// `max_bytes`, further lines are dropped and [`ActivityLog::append`] reports
/// the overflow.
#[derive(Debug)]
pub struct ActivityLog {
    max_bytes: u64,
    state: Mutex<LogState>,
}

impl ActivityLog {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Starts a fresh log, writing to `<dir>/encode_<pid>.log` when a
    /// directory is given.
    pub fn begin(&self, dir: Option<&Path>, pid: u32) -> io::Result<()> {
        let mut state = self.lock();
        *state = LogState::default();

        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("encode_{}.log", pid));
            state.file = Some(File::create(&path)?);
            state.path = Some(path);
        }
        Ok(())
    }

    /// Appends one line. Returns `false` once the size limit is exceeded.
    pub fn append(&self, line: &str) -> bool {
        let mut state = self.lock();
        if state.bytes > self.max_bytes {
            return false;
        }

        state.bytes += line.len() as u64 + 1;
        if let Some(file) = state.file.as_mut() {
            if writeln!(file, "{}", line).is_err() {
                state.file = None;
            }
        }
        if state.tail.len() == TAIL_LINES {
            state.tail.pop_front();
        }
        state.tail.push_back(line.to_string());

        state.bytes <= self.max_bytes
    }

    /// Bytes written since the last [`ActivityLog::begin`].
    pub fn len_bytes(&self) -> u64 {
        self.lock().bytes
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    /// The most recent lines, newline-separated.
    pub fn text(&self) -> String {
        let state = self.lock();
        let mut text = String::new();
        for line in &state.tail {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    /// Flushes the file, if any.
    pub fn flush(&self) {
        if let Some(file) = self.lock().file.as_mut() {
            let _ = file.flush();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
