//! Configuration management for onibi
//!
//! Handles loading and validation of `onibi.toml`. Every field has a default,
//! so an absent file or an empty section yields a working configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogLevel;

/// Directory under `$HOME` holding the hook log, config and state.
pub const ONIBI_DIR: &str = ".config/onibi";
pub const CONFIG_FILE_NAME: &str = "onibi.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub detectors: DetectorsConfig,

    #[serde(default)]
    pub reducer: ReducerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub truncator: TruncatorConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

// =============================================================================
// General
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}. Expected pretty or json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file in addition to stderr
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Watch / tail
// =============================================================================

/// Which notification backend the watcher uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    /// Native backend, falling back to polling if it cannot start
    #[default]
    Auto,
    Native,
    Poll,
}

impl fmt::Display for WatchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Native => f.write_str("native"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

impl FromStr for WatchBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown watch backend: {other}")),
        }
    }
}

/// Where a fresh tailer (no persisted watermark) starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Skip history already in the file
    #[default]
    End,
    Beginning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_log_path")]
    pub path: String,

    #[serde(default)]
    pub backend: WatchBackend,

    /// Poll interval for the polling backend
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound between ticks when no notification arrives
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub start_position: StartPosition,

    /// Create the log file (and its directory) at startup when absent
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            backend: WatchBackend::Auto,
            poll_interval_ms: default_poll_interval(),
            tick_interval_ms: default_tick_interval(),
            start_position: StartPosition::End,
            create_if_missing: true,
            max_read_bytes: default_max_read_bytes(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_log_path() -> String {
    format!("~/{ONIBI_DIR}/terminal.log")
}

fn default_poll_interval() -> u64 {
    500
}

fn default_tick_interval() -> u64 {
    250
}

fn default_max_read_bytes() -> usize {
    1024 * 1024
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

// =============================================================================
// Detectors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorsConfig {
    /// Per-detector bound on tracked sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub ai_response: AiResponseConfig,

    #[serde(default)]
    pub task_completion: TaskCompletionConfig,

    #[serde(default)]
    pub dev_workflow: DevWorkflowConfig,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            ai_response: AiResponseConfig::default(),
            task_completion: TaskCompletionConfig::default(),
            dev_workflow: DevWorkflowConfig::default(),
        }
    }
}

fn default_max_sessions() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A start marker older than this is abandoned
    #[serde(default = "default_ai_max_gap")]
    pub max_gap_ms: u64,
}

impl Default for AiResponseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_gap_ms: default_ai_max_gap(),
        }
    }
}

fn default_ai_max_gap() -> u64 {
    10 * 60 * 1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Commands finishing faster than this are not reported
    #[serde(default)]
    pub min_duration_ms: u64,

    #[serde(default = "default_max_pending")]
    pub max_pending_ms: u64,
}

impl Default for TaskCompletionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duration_ms: 0,
            max_pending_ms: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevWorkflowConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_pending")]
    pub max_pending_ms: u64,
}

impl Default for DevWorkflowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending_ms: default_max_pending(),
        }
    }
}

fn default_max_pending() -> u64 {
    6 * 60 * 60 * 1000
}

// =============================================================================
// Reducer / bus
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerConfig {
    /// Deduplication window W
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Candidates below this confidence are dropped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_entries: default_max_entries(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_window_ms() -> u64 {
    5_000
}

fn default_max_entries() -> usize {
    4096
}

fn default_min_confidence() -> f64 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

// =============================================================================
// Truncation / persistence / retry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rotate as soon as the file reaches this size
    #[serde(default = "default_truncate_max_bytes")]
    pub max_bytes: u64,

    /// Never rotate before this many bytes have been consumed
    #[serde(default = "default_min_consumed")]
    pub min_consumed_bytes: u64,

    /// Periodic rotation cadence
    #[serde(default = "default_truncate_interval")]
    pub interval_secs: u64,
}

impl Default for TruncatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_truncate_max_bytes(),
            min_consumed_bytes: default_min_consumed(),
            interval_secs: default_truncate_interval(),
        }
    }
}

fn default_truncate_max_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_min_consumed() -> u64 {
    256 * 1024
}

fn default_truncate_interval() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_true")]
    pub persist_dedup_window: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: default_state_dir(),
            persist_dedup_window: true,
        }
    }
}

fn default_state_dir() -> String {
    format!("~/{ONIBI_DIR}/state")
}

/// Backoff for failed ticks. Attempts are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Random jitter as a fraction of the delay (0.1 = ±10%)
    #[serde(default = "default_jitter")]
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: default_jitter(),
        }
    }
}

fn default_initial_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Default config file location: `~/.config/onibi/onibi.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        expand_tilde(&format!("~/{ONIBI_DIR}/{CONFIG_FILE_NAME}"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file at the default location yields defaults; an explicitly
    /// named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if let Err(reason) = self.general.log_level.parse::<LogLevel>() {
            return Err(invalid("general.log_level", &reason));
        }
        if self.watch.path.trim().is_empty() {
            return Err(invalid("watch.path", "must not be empty"));
        }
        if self.watch.tick_interval_ms == 0 {
            return Err(invalid("watch.tick_interval_ms", "must be greater than zero"));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(invalid("watch.poll_interval_ms", "must be greater than zero"));
        }
        if self.watch.max_read_bytes == 0 {
            return Err(invalid("watch.max_read_bytes", "must be greater than zero"));
        }
        if self.watch.max_line_bytes == 0 {
            return Err(invalid("watch.max_line_bytes", "must be greater than zero"));
        }
        if self.detectors.max_sessions == 0 {
            return Err(invalid("detectors.max_sessions", "must be greater than zero"));
        }
        if self.reducer.window_ms == 0 {
            return Err(invalid("reducer.window_ms", "must be greater than zero"));
        }
        if self.reducer.max_entries == 0 {
            return Err(invalid("reducer.max_entries", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.reducer.min_confidence) {
            return Err(invalid("reducer.min_confidence", "must be within 0.0..=1.0"));
        }
        if self.bus.queue_capacity == 0 {
            return Err(invalid("bus.queue_capacity", "must be greater than zero"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(invalid("retry.jitter_percent", "must be within 0.0..=1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.initial_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        Ok(())
    }

    /// The watched log path with `~` expanded.
    pub fn log_path(&self) -> Result<PathBuf, ConfigError> {
        expand_tilde(&self.watch.path)
    }

    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        expand_tilde(&self.persistence.state_dir)
    }

    pub fn log_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.general
            .log_file
            .as_deref()
            .map(expand_tilde)
            .transpose()
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &str) -> Result<PathBuf, ConfigError> {
    if path == "~" {
        return dirs::home_dir().ok_or_else(|| ConfigError::NoHomeDir(path.to_string()));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or_else(|| ConfigError::NoHomeDir(path.to_string())),
        None => Ok(PathBuf::from(path)),
    }
}
