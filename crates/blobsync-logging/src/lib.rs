//! Tracing subscriber setup for blobsync processes
//!
//! Every server that runs a sync engine installs one global subscriber at
//! startup. Output goes to the console as JSONL (default) or pretty text,
//! and optionally to a rotating JSONL file.
//!
//! # Quick Start
//!
//! ```ignore
//! use blobsync_logging::{LogConfig, SyncSubscriberBuilder};
//!
//! // JSONL to console, level from RUST_LOG or "info"
//! let _guard = SyncSubscriberBuilder::new().init();
//!
//! // Human-readable output while developing
//! let _guard = SyncSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! The returned guard flushes file output when dropped, so keep it alive for
//! the lifetime of the process.

pub mod config;
pub mod error;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use error::{LogError, LogResult};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync + 'static>;

/// Builder for configuring and installing the blobsync subscriber
///
/// By default console output uses JSONL. Use [`LogConfig::development`] for
/// pretty output.
#[derive(Debug, Clone, Default)]
pub struct SyncSubscriberBuilder {
    config: LogConfig,
}

impl SyncSubscriberBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Filter applied when `RUST_LOG` is unset
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Turn console output on or off
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Also write JSONL files as `file` describes
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// The configuration this builder will install
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// `RUST_LOG` takes precedence over the configured default level. The
    /// returned guard is `Some` when file output is enabled.
    pub fn try_init(self) -> LogResult<Option<WorkerGuard>> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => parse_filter(&self.config.default_level)?,
        };
        let (layers, guard) = self.layers()?;

        Registry::default().with(env_filter).with(layers).try_init()?;
        Ok(guard)
    }

    /// Install the subscriber, reporting failures on stderr
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging not initialized: {e}");
                None
            }
        }
    }

    fn layers(&self) -> LogResult<(Vec<BoxedLayer>, Option<WorkerGuard>)> {
        let mut layers = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            let console = &self.config.console;
            let layer: BoxedLayer = if console.pretty {
                tracing_subscriber::fmt::layer()
                    .with_ansi(console.ansi)
                    .with_target(true)
                    .boxed()
            } else {
                json_layer(&self.config.jsonl, std::io::stdout)
            };
            let layer = match &console.level {
                Some(level) => layer.with_filter(parse_filter(level)?).boxed(),
                None => layer,
            };
            layers.push(layer);
        }

        if let Some(file) = &self.config.file {
            let (writer, file_guard) = file_writer(file)?;
            layers.push(json_layer(&self.config.jsonl, writer));
            guard = Some(file_guard);
        }

        Ok((layers, guard))
    }
}

fn parse_filter(directive: &str) -> LogResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| LogError::InvalidDirective {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}

fn json_layer<W>(jsonl: &JsonlConfig, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .json()
        .with_current_span(jsonl.include_current_span)
        .with_span_list(jsonl.include_spans)
        .flatten_event(jsonl.flatten_events)
        .with_thread_ids(jsonl.include_thread_info)
        .with_file(jsonl.include_location)
        .with_line_number(jsonl.include_location)
        .with_writer(writer)
        .boxed()
}

/// Non-blocking writer for file output; `Never` truncates a single file,
/// the other strategies roll by time
fn file_writer(file: &FileConfig) -> LogResult<(NonBlocking, WorkerGuard)> {
    let rotation = match file.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&file.directory).map_err(|source| LogError::Io {
                path: file.directory.clone(),
                source,
            })?;
            let path = file.single_file_path();
            let handle = File::create(&path).map_err(|source| LogError::Io { path, source })?;
            return Ok(tracing_appender::non_blocking(handle));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file.prefix.as_str())
        .filename_suffix("log");
    if let Some(max) = file.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder.build(&file.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install a subscriber for `config`
pub fn try_init(config: LogConfig) -> LogResult<Option<WorkerGuard>> {
    SyncSubscriberBuilder::new().with_config(config).try_init()
}

/// Default JSONL console logging
pub fn init_default() {
    SyncSubscriberBuilder::new().init();
}

/// Pretty console logging at debug level
pub fn init_development() {
    SyncSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Warn-level logging for tests; repeated calls are ignored
pub fn init_testing() {
    let _ = try_init(LogConfig::testing());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_builder_uses_defaults() {
        let builder = SyncSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
        assert!(!builder.config().console.pretty);
    }

    #[test]
    fn test_builder_takes_preset() {
        let builder = SyncSubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config().default_level, "debug");
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_builder_setters() {
        let builder = SyncSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false)
            .with_file_output(FileConfig::in_dir("/tmp/blobsync-logs"));
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
        assert!(builder.config().file.is_some());
    }

    #[test]
    fn test_invalid_console_level_rejected() {
        let mut config = LogConfig::testing();
        config.console.level = Some("blobsync=loud".to_string());
        let result = SyncSubscriberBuilder::new().with_config(config).layers();
        assert!(matches!(result, Err(LogError::InvalidDirective { .. })));
    }

    #[test]
    fn test_layers_follow_config() {
        let (layers, guard) = SyncSubscriberBuilder::new()
            .with_console(false)
            .layers()
            .unwrap();
        assert!(layers.is_empty());
        assert!(guard.is_none());
    }

    #[test]
    fn test_single_file_writer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = FileConfig {
            directory: temp_dir.path().join("nested").join("logs"),
            rotation: RotationStrategy::Never,
            ..FileConfig::default()
        };

        let (_writer, _guard) = file_writer(&file).unwrap();
        assert!(file.single_file_path().exists());
    }

    #[test]
    fn test_rolling_writer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = FileConfig {
            directory: temp_dir.path().join("rolling"),
            rotation: RotationStrategy::Hourly,
            max_files: Some(2),
            ..FileConfig::default()
        };

        let (_writer, _guard) = file_writer(&file).unwrap();
        assert!(file.directory.is_dir());
    }
}
