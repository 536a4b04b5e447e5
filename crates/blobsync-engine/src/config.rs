//! Configuration for the sync engine
//!
//! Every field has a default, so a TOML file only needs the values it
//! overrides:
//!
//! ```toml
//! autosave_interval_secs = 60
//! post_apply_cleanup = "^tmp\\."
//!
//! [bus]
//! channel = "myapp:sync"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blobsync_bus::{DEFAULT_CHANNEL, GossipConfig};
use blobsync_storage::RedbStoreConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Configuration for a [`SyncEngine`](crate::SyncEngine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Load stored state when an entity attaches
    pub load_on_join: bool,
    /// Save once more when an entity detaches
    pub save_on_detach: bool,
    /// Seconds between autosave sweeps; 0 disables the sweep
    pub autosave_interval_secs: u64,
    /// Tick offsets, counted from attach, of the extra apply attempts
    pub join_retry_ticks: Vec<u32>,
    /// How long after a load an unchanged save is suppressed
    pub grace_window_ms: u64,
    /// Keys matching this pattern are pruned from owner state after each apply
    pub post_apply_cleanup: Option<String>,
    /// Worker threads for store and bus I/O
    pub io_workers: usize,
    /// Capacity of the worker to owning-thread hand-off queue
    pub inbox_capacity: usize,
    /// Upper bound on waiting for in-flight I/O at shutdown
    pub shutdown_timeout_ms: u64,
    /// State store settings
    pub storage: StoreSection,
    /// Replication bus settings
    pub bus: BusSection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            load_on_join: true,
            save_on_detach: true,
            autosave_interval_secs: 300,
            join_retry_ticks: vec![100, 120],
            grace_window_ms: 12_000,
            post_apply_cleanup: None,
            io_workers: 2,
            inbox_capacity: 1024,
            shutdown_timeout_ms: 5_000,
            storage: StoreSection::default(),
            bus: BusSection::default(),
        }
    }
}

/// State store section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Path of the redb database file
    pub db_path: PathBuf,
    /// Create the table at open if it is missing
    pub create_schema: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/blobsync.redb"),
            create_schema: true,
        }
    }
}

/// Replication bus section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Publish saves and apply remote changes
    pub enabled: bool,
    /// Channel shared by every process
    pub channel: String,
    /// Endpoint key and peers for
    /// [`GossipTransport`](blobsync_bus::GossipTransport)
    pub gossip: GossipConfig,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: DEFAULT_CHANNEL.to_string(),
            gossip: GossipConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Configuration for tests: no autosave, short shutdown
    pub fn testing() -> Self {
        Self {
            autosave_interval_secs: 0,
            shutdown_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    pub fn with_load_on_join(mut self, enabled: bool) -> Self {
        self.load_on_join = enabled;
        self
    }

    pub fn with_save_on_detach(mut self, enabled: bool) -> Self {
        self.save_on_detach = enabled;
        self
    }

    pub fn with_autosave_interval_secs(mut self, secs: u64) -> Self {
        self.autosave_interval_secs = secs;
        self
    }

    pub fn with_join_retry_ticks(mut self, ticks: impl Into<Vec<u32>>) -> Self {
        self.join_retry_ticks = ticks.into();
        self
    }

    pub fn with_grace_window_ms(mut self, ms: u64) -> Self {
        self.grace_window_ms = ms;
        self
    }

    pub fn with_post_apply_cleanup(mut self, pattern: impl Into<String>) -> Self {
        self.post_apply_cleanup = Some(pattern.into());
        self
    }

    pub fn with_io_workers(mut self, workers: usize) -> Self {
        self.io_workers = workers;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.db_path = path.into();
        self
    }

    pub fn with_bus_enabled(mut self, enabled: bool) -> Self {
        self.bus.enabled = enabled;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.bus.channel = channel.into();
        self
    }

    /// Grace window as signed milliseconds, for comparison with timestamps
    pub fn grace_window_millis(&self) -> i64 {
        i64::try_from(self.grace_window_ms).unwrap_or(i64::MAX)
    }

    /// Autosave interval in milliseconds, `None` when disabled
    pub fn autosave_interval_millis(&self) -> Option<i64> {
        match self.autosave_interval_secs {
            0 => None,
            secs => Some(i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Store configuration derived from the storage section
    pub fn store_config(&self) -> RedbStoreConfig {
        RedbStoreConfig {
            db_path: self.storage.db_path.clone(),
            create_schema: self.storage.create_schema,
            ..RedbStoreConfig::default()
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_workers == 0 {
            return Err(ConfigError::invalid("io_workers", "must be at least 1"));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::invalid("inbox_capacity", "must be at least 1"));
        }
        if self.bus.enabled && self.bus.channel.is_empty() {
            return Err(ConfigError::invalid("bus.channel", "must not be empty"));
        }
        if let Err(e) = self.bus.gossip.bootstrap_ids() {
            return Err(ConfigError::invalid("bus.gossip.bootstrap", e.to_string()));
        }
        Ok(())
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, writing the defaults first if the file is missing
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        if let Err(e) = config.write(path) {
            warn!(path = %path.display(), error = %e, "Failed to write default config");
        } else {
            info!(path = %path.display(), "Wrote default config");
        }
        Ok(config)
    }

    /// Write configuration as TOML
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
