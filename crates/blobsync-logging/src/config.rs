//! What the subscriber writes, and where
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file only
//! lists what it changes. `RUST_LOG` always wins over `default_level`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Subscriber settings for one process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `blobsync_engine=debug`
    pub default_level: String,
    pub console: ConsoleConfig,
    /// Off unless set
    pub file: Option<FileConfig>,
    /// Shape of JSON lines, shared by the console and the file
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::with_console("info", ConsoleConfig::default())
    }
}

impl LogConfig {
    fn with_console(level: &str, console: ConsoleConfig) -> Self {
        Self {
            default_level: level.to_string(),
            console,
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }

    /// Colored console text at debug level
    pub fn development() -> Self {
        Self::with_console("debug", ConsoleConfig::human(Some("debug")))
    }

    /// Colored text at info level, for watching a simulation run
    pub fn summary() -> Self {
        Self::with_console("info", ConsoleConfig::human(None))
    }

    /// Daily JSONL files under `log_dir` kept for a month; nothing on the console
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            file: Some(FileConfig {
                max_files: Some(30),
                ..FileConfig::in_dir(log_dir)
            }),
            ..Self::with_console("info", ConsoleConfig::disabled())
        }
    }

    /// Warnings only, uncolored, so test output stays readable
    pub fn testing() -> Self {
        Self::with_console(
            "warn",
            ConsoleConfig {
                level: Some("warn".to_string()),
                ..ConsoleConfig::default()
            },
        )
    }
}

/// Stdout output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Text lines instead of JSON lines
    pub pretty: bool,
    /// Color codes; only meaningful with `pretty`
    pub ansi: bool,
    /// Narrows the console below `default_level` without touching the file
    pub level: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
            level: None,
        }
    }
}

impl ConsoleConfig {
    fn human(level: Option<&str>) -> Self {
        Self {
            enabled: true,
            pretty: true,
            ansi: true,
            level: level.map(str::to_string),
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// JSONL log files written through a non-blocking appender
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// Files are named `<prefix>.<date>` when rotating, `<prefix>.log` otherwise
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Oldest rotated files beyond this count are deleted
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self::in_dir("./logs")
    }
}

impl FileConfig {
    /// Daily files named `blobsync.*` in `directory`, a week kept
    pub fn in_dir(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: "blobsync".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        }
    }

    /// The file written when rotation is [`RotationStrategy::Never`]
    pub fn single_file_path(&self) -> PathBuf {
        self.directory.join(format!("{}.log", self.prefix))
    }
}

/// When a new log file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One file, truncated at startup
    Never,
}

/// Which parts of an event end up in each JSON line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// `entity`, `hash` and friends at the top level instead of under `fields`
    pub flatten_events: bool,
    pub include_spans: bool,
    pub include_current_span: bool,
    pub include_thread_info: bool,
    /// Source file and line
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_current_span: true,
            include_thread_info: false,
            include_location: true,
        }
    }
}
