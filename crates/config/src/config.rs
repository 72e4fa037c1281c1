//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Which executor drives the encoding engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    /// Spawn the engine as an external process per job
    #[default]
    Process,
    /// Drive a long-lived in-process engine handle
    Engine,
}

impl FromStr for EncoderBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "engine" => Ok(Self::Engine),
            _ => Err(()),
        }
    }
}

/// OS scheduling priority hint for the encoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPriority {
    Realtime,
    High,
    AboveNormal,
    Normal,
    Low,
    #[default]
    BelowNormal,
}

impl ProcessPriority {
    /// Unix niceness equivalent of this priority class
    pub fn niceness(&self) -> i32 {
        match self {
            ProcessPriority::Realtime => -20,
            ProcessPriority::High => -10,
            ProcessPriority::AboveNormal => -5,
            ProcessPriority::Normal => 0,
            ProcessPriority::BelowNormal => 10,
            ProcessPriority::Low => 19,
        }
    }
}

impl FromStr for ProcessPriority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "realtime" => Ok(Self::Realtime),
            "high" => Ok(Self::High),
            "above_normal" => Ok(Self::AboveNormal),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "below_normal" => Ok(Self::BelowNormal),
            _ => Err(()),
        }
    }
}

/// Action performed once the whole queue has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostQueueAction {
    #[default]
    None,
    Shutdown,
    LogOff,
    Sleep,
    Hibernate,
    Lock,
    QuitApp,
}

impl FromStr for PostQueueAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "none" => Ok(Self::None),
            "shutdown" => Ok(Self::Shutdown),
            "log_off" | "logoff" => Ok(Self::LogOff),
            "sleep" | "suspend" => Ok(Self::Sleep),
            "hibernate" => Ok(Self::Hibernate),
            "lock" => Ok(Self::Lock),
            "quit_app" | "quit" => Ok(Self::QuitApp),
            _ => Err(()),
        }
    }
}

/// Encoder-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default)]
    pub backend: EncoderBackend,
    /// Encoder executable used by the process backend
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    #[serde(default)]
    pub priority: ProcessPriority,
    /// Capture the encoder's diagnostic stream into an activity log
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
    /// Directory for activity logs (defaults to `<state_dir>/logs`)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// An encode whose log grows past this many bytes is stopped
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,
    /// Upper bound on waiting for trailing log lines after the process exits
    #[serde(default = "default_exit_drain_timeout_ms")]
    pub exit_drain_timeout_ms: u64,
    /// Ask the host not to sleep while a job is encoding
    #[serde(default = "default_true")]
    pub prevent_sleep: bool,
}

fn default_executable() -> PathBuf {
    PathBuf::from("HandBrakeCLI")
}

fn default_true() -> bool {
    true
}

fn default_max_log_bytes() -> u64 {
    100_000_000
}

fn default_exit_drain_timeout_ms() -> u64 {
    2500
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: EncoderBackend::default(),
            executable: default_executable(),
            priority: ProcessPriority::default(),
            logging_enabled: true,
            log_dir: None,
            max_log_bytes: default_max_log_bytes(),
            exit_drain_timeout_ms: default_exit_drain_timeout_ms(),
            prevent_sleep: true,
        }
    }
}

/// Queue behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueConfig {
    /// Remove completed jobs from the queue after each job finishes
    #[serde(default)]
    pub clear_completed_on_finish: bool,
    #[serde(default)]
    pub post_queue_action: PostQueueAction,
    /// Directory holding recovery snapshots (platform default if None)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Battery and disk gating configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub pause_on_low_battery: bool,
    /// Pause when on battery at or below this percentage (default 15)
    #[serde(default = "default_battery_threshold_percent")]
    pub battery_threshold_percent: u8,
    #[serde(default = "default_true")]
    pub pause_on_low_disk: bool,
    /// Minimum free bytes at a destination directory (default 2 GiB)
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_battery_threshold_percent() -> u8 {
    15
}

fn default_min_free_disk_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            pause_on_low_battery: true,
            battery_threshold_percent: default_battery_threshold_percent(),
            pause_on_low_disk: true,
            min_free_disk_bytes: default_min_free_disk_bytes(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODE_QUEUE_BACKEND -> encoder.backend
    /// - ENCODE_QUEUE_EXECUTABLE -> encoder.executable
    /// - ENCODE_QUEUE_PRIORITY -> encoder.priority
    /// - ENCODE_QUEUE_PREVENT_SLEEP -> encoder.prevent_sleep
    /// - ENCODE_QUEUE_CLEAR_COMPLETED -> queue.clear_completed_on_finish
    /// - ENCODE_QUEUE_POST_ACTION -> queue.post_queue_action
    /// - ENCODE_QUEUE_STATE_DIR -> queue.state_dir
    /// - ENCODE_QUEUE_BATTERY_THRESHOLD -> health.battery_threshold_percent
    /// - ENCODE_QUEUE_MIN_FREE_DISK_BYTES -> health.min_free_disk_bytes
    pub fn apply_env_overrides(&mut self) {
        if let Some(backend) = env_parsed::<EncoderBackend>("ENCODE_QUEUE_BACKEND") {
            self.encoder.backend = backend;
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_EXECUTABLE") {
            if !val.trim().is_empty() {
                self.encoder.executable = PathBuf::from(val);
            }
        }

        if let Some(priority) = env_parsed::<ProcessPriority>("ENCODE_QUEUE_PRIORITY") {
            self.encoder.priority = priority;
        }

        if let Some(flag) = env_bool("ENCODE_QUEUE_PREVENT_SLEEP") {
            self.encoder.prevent_sleep = flag;
        }

        if let Some(flag) = env_bool("ENCODE_QUEUE_CLEAR_COMPLETED") {
            self.queue.clear_completed_on_finish = flag;
        }

        if let Some(action) = env_parsed::<PostQueueAction>("ENCODE_QUEUE_POST_ACTION") {
            self.queue.post_queue_action = action;
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_STATE_DIR") {
            if !val.trim().is_empty() {
                self.queue.state_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_BATTERY_THRESHOLD") {
            if let Ok(percent) = val.parse::<u8>() {
                self.health.battery_threshold_percent = percent.min(100);
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_MIN_FREE_DISK_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.health.min_free_disk_bytes = bytes;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Directory holding recovery snapshots
    ///
    /// Falls back to `$XDG_STATE_HOME/encode-queue`, then
    /// `$HOME/.local/state/encode-queue`, then `./.encode-queue`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.queue.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = env::var("XDG_STATE_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("encode-queue");
            }
        }
        if let Ok(home) = env::var("HOME") {
            if !home.is_empty() {
                return PathBuf::from(home).join(".local/state/encode-queue");
            }
        }
        PathBuf::from(".encode-queue")
    }

    /// Directory for encoder activity logs
    pub fn log_dir(&self) -> PathBuf {
        self.encoder
            .log_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("logs"))
    }
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse::<T>().ok())
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(key: &str) -> Option<bool> {
    let val = env::var(key).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
