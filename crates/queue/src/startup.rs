//! Startup checks for the encode queue
//!
//! Preflight checks run before the queue starts:
//! - Encoder availability (process backend only)
//! - State directory is writable

use crate::config::{Config, EncoderBackend};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("State directory {path} is not writable: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Extract the version from an encoder's `--version` output
///
/// Looks for the first whitespace-separated token that starts with a digit,
/// e.g. `1.8.2` from "HandBrake 1.8.2".
pub fn parse_encoder_version(output: &str) -> Option<String> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .map(|token| token.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string())
}

/// Check that the encoder executable runs
///
/// # Arguments
/// * `executable` - Program name or path of the encoder
///
/// # Returns
/// The reported version, if one could be parsed
pub fn check_encoder_available(executable: &Path) -> Result<Option<String>, StartupError> {
    let output = Command::new(executable)
        .arg("--version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} --version failed; is it installed and in PATH? Error: {}",
                executable.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} --version exited with {}",
            executable.display(),
            output.status
        )));
    }

    // Some encoders print their banner on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(parse_encoder_version(&stdout).or_else(|| parse_encoder_version(&stderr)))
}

/// Check that the state directory exists (creating it) and accepts writes
pub fn check_state_dir_writable(dir: &Path) -> Result<(), StartupError> {
    let to_error = |source| StartupError::StateDir {
        path: dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(to_error)?;
    let probe = dir.join(format!(".write_check_{}", std::process::id()));
    fs::write(&probe, b"ok").map_err(to_error)?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Encoder availability (process backend)
/// 2. State directory writability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    if cfg.encoder.backend == EncoderBackend::Process {
        check_encoder_available(&cfg.encoder.executable)?;
    }
    check_state_dir_writable(&cfg.state_dir())?;
    Ok(())
}
