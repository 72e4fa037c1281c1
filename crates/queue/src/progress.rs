//! Progress parsing for encoder output.
//!
//! The external encoder reports progress as text lines of the form
//! `Encoding: task 1 of 2, 42.10 % (87.52 fps, avg 90.01 fps, ETA 00h12m31s)`,
//! terminated by either `\r` or `\n`. The in-process engine reports the same
//! information through [`EngineProgress`] payloads. Both end up as
//! [`EncodeProgress`].

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

static PROGRESS_REGEX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^\s*Encoding: task (\d+) of (\d+), (\d+(?:\.\d+)?) %(?: \((\d+(?:\.\d+)?) fps, avg (\d+(?:\.\d+)?) fps, ETA (\d{2,})h(\d{2})m(\d{2})s\))?",
    )
    .ok()
});

/// One decoded progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EncodeProgress {
    /// Current pass (1-based).
    pub pass: u32,
    /// Total number of passes.
    pub pass_count: u32,
    /// Percent complete for the current pass, 0 to 100.
    pub percent: f32,
    /// Current throughput in frames per second.
    pub current_rate: Option<f32>,
    /// Rolling-average throughput in frames per second.
    pub average_rate: Option<f32>,
    /// Estimated time remaining; `None` while still calculating.
    pub eta: Option<Duration>,
    /// Wall-clock time since the job started.
    pub elapsed: Duration,
    /// Set on the synthetic event raised when the output stream failed.
    #[serde(default)]
    pub status_unavailable: bool,
}

impl EncodeProgress {
    /// Synthetic event used when the encoder's progress stream cannot be read.
    pub fn unavailable() -> Self {
        Self {
            status_unavailable: true,
            ..Default::default()
        }
    }

    /// Returns a copy stamped with the given elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Native progress payload from the in-process engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineProgress {
    pub pass: u32,
    pub pass_count: u32,
    /// Fraction complete for the current pass, 0.0 to 1.0.
    pub fraction_complete: f32,
    pub current_rate: f32,
    pub average_rate: f32,
    /// Seconds remaining, if the engine has an estimate.
    pub eta_seconds: Option<u64>,
}

/// Stateless parser turning encoder output into [`EncodeProgress`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressParser;

impl ProgressParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses a single output line.
    ///
    /// Returns `None` for lines that are not progress lines or are garbled.
    pub fn parse_line(&self, line: &str) -> Option<EncodeProgress> {
        let regex = PROGRESS_REGEX.as_ref()?;
        let caps = regex.captures(line)?;

        let pass = caps.get(1)?.as_str().parse::<u32>().ok()?;
        let pass_count = caps.get(2)?.as_str().parse::<u32>().ok()?;
        let percent = caps.get(3)?.as_str().parse::<f32>().ok()?;

        let current_rate = caps.get(4).and_then(|m| m.as_str().parse::<f32>().ok());
        let average_rate = caps.get(5).and_then(|m| m.as_str().parse::<f32>().ok());
        let eta = match (caps.get(6), caps.get(7), caps.get(8)) {
            (Some(h), Some(m), Some(s)) => {
                hms_to_duration(h.as_str(), m.as_str(), s.as_str())
            }
            _ => None,
        };

        Some(EncodeProgress {
            pass,
            pass_count,
            percent: percent.clamp(0.0, 100.0),
            current_rate,
            average_rate,
            eta,
            elapsed: Duration::ZERO,
            status_unavailable: false,
        })
    }

    /// Converts an engine payload into the common progress shape.
    pub fn from_engine(&self, progress: &EngineProgress) -> EncodeProgress {
        EncodeProgress {
            pass: progress.pass,
            pass_count: progress.pass_count,
            percent: (progress.fraction_complete * 100.0).clamp(0.0, 100.0),
            current_rate: Some(progress.current_rate),
            average_rate: Some(progress.average_rate),
            eta: progress.eta_seconds.map(Duration::from_secs),
            elapsed: Duration::ZERO,
            status_unavailable: false,
        }
    }
}

/// Parses an ETA token in `HHhMMmSSs` or `HH:MM:SS` form.
///
/// Returns `None` for anything else, which callers treat as "calculating".
pub fn parse_eta(text: &str) -> Option<Duration> {
    let text = text.trim();

    if let Some(rest) = text.strip_suffix('s') {
        let (hours, rest) = rest.split_once('h')?;
        let (minutes, seconds) = rest.split_once('m')?;
        return hms_to_duration(hours, minutes, seconds);
    }

    let mut parts = text.split(':');
    let hours = parts.next()?;
    let minutes = parts.next()?;
    let seconds = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    hms_to_duration(hours, minutes, seconds)
}

fn hms_to_duration(hours: &str, minutes: &str, seconds: &str) -> Option<Duration> {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(hours) || !all_digits(minutes) || !all_digits(seconds) {
        return None;
    }

    let hours = hours.parse::<u64>().ok()?;
    let minutes = minutes.parse::<u64>().ok()?;
    let seconds = seconds.parse::<u64>().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    let total = hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)?;
    Some(Duration::from_secs(total))
}

/// Splits a raw byte stream into lines on `\r` or `\n`.
///
/// Invalid UTF-8 is decoded lossily. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if !self.buffer.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    self.buffer.clear();
                }
            } else {
                self.buffer.push(byte);
            }
        }
        lines
    }

    /// Returns whatever trailing text was left without a terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}
