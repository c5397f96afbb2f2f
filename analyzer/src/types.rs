//! Public configuration and event types.
//!
//! The host deserializes [`OrchestratorConfig`] (usually via `anchor-config`),
//! subscribes to [`ParseComplete`]/[`AnalysisComplete`] per document, and
//! watches [`AnalyzerExited`] for abnormal process exits.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use anchor_types::{BufferId, FileId};

const fn default_quiet_period_ms() -> u64 {
    1000
}

const fn default_stop_timeout_ms() -> u64 {
    10_000
}

const fn default_channel_capacity() -> usize {
    256
}

/// How to launch the out-of-process analyzer.
///
/// One process is started per interpreter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Executable command, resolved through `PATH`.
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Interpreter the analyzer should model (passed through `initialize`).
    #[serde(default)]
    interpreter_id: Option<String>,
    #[serde(default)]
    language_version: Option<String>,
}

impl AnalyzerConfig {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            interpreter_id: None,
            language_version: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn interpreter_id(&self) -> Option<&str> {
        self.interpreter_id.as_deref()
    }

    #[must_use]
    pub fn language_version(&self) -> Option<&str> {
        self.language_version.as_deref()
    }
}

/// Edit coalescing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last edit before a debounced sync fires.
    #[serde(default = "default_quiet_period_ms")]
    quiet_period_ms: u64,
    /// Sync on every edit. Meant for tests and scratch buffers.
    #[serde(default)]
    sync_immediately: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            sync_immediately: false,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    #[must_use]
    pub fn sync_immediately(&self) -> bool {
        self.sync_immediately
    }
}

/// Local work queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_stop_timeout_ms")]
    stop_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Capacities of the internal event channels.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl EventsConfig {
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

/// Everything the orchestrator needs apart from the analyzer command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Name of a logical file as the analyzer knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentPath {
    /// A file on disk.
    File(PathBuf),
    /// An unsaved or REPL-backed buffer with no path.
    Synthetic(String),
}

impl DocumentPath {
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Synthetic(name) => write!(f, "<{name}>"),
        }
    }
}

/// The analyzer finished parsing a buffer at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseComplete {
    pub file_id: FileId,
    pub buffer_id: BufferId,
    pub version: i32,
}

/// The analyzer finished analyzing a buffer at `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisComplete {
    pub file_id: FileId,
    pub buffer_id: BufferId,
    pub version: i32,
}

/// The analyzer process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerExited {
    pub reason: StopReason,
}

/// Why the analyzer transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The process closed its output; `code` is its exit status if it could
    /// be collected and `stderr` the tail of its diagnostic output.
    Exited { code: Option<i32>, stderr: String },
    /// Reading from the process failed.
    Failed(String),
}

/// An event emitted by the transport towards the orchestrator.
#[derive(Debug)]
pub enum AnalyzerEvent {
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    Stopped {
        reason: StopReason,
    },
}
