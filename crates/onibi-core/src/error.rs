//! Error types for onibi-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

use crate::detection::DetectorId;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
    /// Optional platform hint (e.g., "macOS", "Linux")
    pub platform: Option<String>,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command without a platform hint
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: None,
        });
        self
    }

    /// Add a command that only applies on one platform
    #[must_use]
    pub fn platform_command(
        mut self,
        label: impl Into<String>,
        command: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: Some(platform.into()),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let label = cmd.platform.as_ref().map_or_else(
                    || cmd.label.clone(),
                    |platform| format!("{} ({platform})", cmd.label),
                );
                let _ = writeln!(output, "    - {label}: {}", cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for onibi-core
#[derive(Error, Debug)]
pub enum Error {
    /// Reading or statting the watched file failed. Recoverable: the
    /// scheduler retries with backoff.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file was replaced while it was being read or rotated.
    #[error("file {path} was replaced during the operation")]
    RotationRace { path: PathBuf },

    /// Filesystem notification backend errors
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Persisted state errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// A detector failed on a single record
    #[error("Detector fault: {0}")]
    Detector(#[from] DetectorFault),

    /// The watched path could not be acquired when the scheduler started.
    #[error("cannot start watching {path}: {reason}")]
    Startup { path: PathBuf, reason: String },

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, invalid lifecycle transitions)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether the pipeline keeps running after this error.
    ///
    /// Only startup failures and invalid configuration are fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Startup { .. } | Self::Config(_))
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Io(_) => Some(
                Remediation::new("Check that the log file and its directory are readable.")
                    .command("Inspect", "ls -la ~/.config/onibi/")
                    .alternative("Transient errors are retried automatically while watching."),
            ),
            Self::RotationRace { .. } => Some(
                Remediation::new("The log was rotated mid-operation; it is picked up on the next tick.")
                    .alternative("Avoid rotating terminal.log from external tools while onibi runs."),
            ),
            Self::Watch(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::State(err) => Some(err.remediation()),
            Self::Detector(_) => Some(
                Remediation::new("A detector rejected one record; other detectors were unaffected.")
                    .command("Inspect the line", "onibi parse '<line>'"),
            ),
            Self::Startup { path, .. } => Some(
                Remediation::new(format!(
                    "Make sure {} exists or can be created.",
                    path.display()
                ))
                .command("Create", format!("mkdir -p \"{}\"", parent_display(path)))
                .command("Show config", "onibi config")
                .alternative("Point watch.path at a writable location in onibi.toml."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Delete corrupt files under the state directory to reset."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the watcher.").command("Restart", "onibi watch"),
            ),
        }
    }
}

fn parent_display(path: &std::path::Path) -> String {
    path.parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string())
}

/// Filesystem notification errors
#[derive(Error, Debug)]
pub enum WatchError {
    /// The notification backend refused to start
    #[error("failed to create {backend} watcher: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: notify::Error,
    },

    /// Installing a watch on the directory failed
    #[error("failed to watch {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The directory holding the watched file does not exist
    #[error("directory {0} does not exist")]
    MissingDirectory(PathBuf),

    /// The watched path has no parent directory or file name
    #[error("invalid watch path: {0}")]
    InvalidPath(PathBuf),
}

impl WatchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Backend { .. } => Remediation::new(
                "The native file notification backend is unavailable; use polling.",
            )
            .command("Use polling", "onibi watch --backend poll")
            .alternative("Set watch.backend = \"poll\" in onibi.toml."),
            Self::Install { path, .. } => Remediation::new(format!(
                "Could not watch {}. Check that the directory exists.",
                path.display()
            ))
            .platform_command("Raise inotify limit", "sysctl fs.inotify.max_user_watches", "Linux")
            .alternative("Use the polling backend."),
            Self::MissingDirectory(dir) => Remediation::new(format!(
                "Create {} or enable watch.create_if_missing.",
                dir.display()
            ))
            .command("Create", format!("mkdir -p \"{}\"", dir.display())),
            Self::InvalidPath(_) => Remediation::new("watch.path must name a file inside a directory.")
                .command("Show config", "onibi config"),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Cannot resolve home directory for {0}")]
    NoHomeDir(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("Print defaults", "onibi config --default"),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Print defaults", "onibi config --default")
            }
            Self::Invalid { field, .. } => {
                Remediation::new(format!("Fix `{field}` in onibi.toml and retry."))
                    .command("Print defaults", "onibi config --default")
            }
            Self::NoHomeDir(_) => Remediation::new("Set HOME or use absolute paths in onibi.toml."),
        }
    }
}

/// Watermark and dedup-window persistence errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state directory {0} is locked by another onibi process")]
    Locked(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Locked(dir) => Remediation::new("Another onibi watcher is already running.")
                .platform_command("Find it", "pgrep -fl 'onibi watch'", "macOS/Linux")
                .alternative(format!(
                    "Point persistence.state_dir somewhere other than {}.",
                    dir.display()
                )),
            Self::Write { path, .. } => Remediation::new(format!(
                "Could not persist state to {}. Check disk space and permissions.",
                path.display()
            ))
            .alternative("Disable persistence with persistence.enabled = false."),
        }
    }
}

/// A detector failed to process one record. Isolated to that detector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{detector} failed on session {session_id}: {reason}")]
pub struct DetectorFault {
    pub detector: DetectorId,
    pub session_id: String,
    pub reason: String,
}

impl DetectorFault {
    #[must_use]
    pub fn new(detector: DetectorId, session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            detector,
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
