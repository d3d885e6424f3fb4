//! Configuration loading and types for sfstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`StoreConfig`] struct.  Each subsection governs a different part of
//! the system: the data directory, WAL checkpointing, statement
//! profiling, and garbage collection.  Every field has a default so an
//! empty file (or a programmatically built config in tests) is valid.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory containing the database and payload files.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// `journal_size_limit` pragma value in bytes.  `-1` leaves the
    /// WAL file unbounded after checkpoints.
    #[serde(default = "default_wal_size_limit")]
    pub wal_size_limit: i64,

    /// WAL checkpoint hook settings.
    #[serde(default)]
    pub wal_checkpoint: WalCheckpointConfig,

    /// Enable per-statement profile tracing.
    #[serde(default)]
    pub sqlite_profile: bool,

    /// Statements slower than this are logged at INFO when profiling
    /// is enabled.
    #[serde(default = "default_slowlog_ms")]
    pub sqlite_profile_slowlog_time_ms: u64,

    /// Garbage collection settings.
    #[serde(default)]
    pub gc: GcConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            wal_size_limit: default_wal_size_limit(),
            wal_checkpoint: WalCheckpointConfig::default(),
            sqlite_profile: false,
            sqlite_profile_slowlog_time_ms: default_slowlog_ms(),
            gc: GcConfig::default(),
        }
    }
}

/// WAL checkpoint hook configuration.
///
/// The embedded engine's own checkpointing lets the WAL grow without
/// bound under many concurrent writers; the hook issues a passive
/// checkpoint past `passive_frames` and a truncating one past
/// `truncate_frames`.
#[derive(Debug, Clone, Deserialize)]
pub struct WalCheckpointConfig {
    /// Frame count above which a passive checkpoint is requested
    /// (1000 frames is roughly 4 MB).
    #[serde(default = "default_passive_frames")]
    pub passive_frames: i64,

    /// Frame count above which a truncating checkpoint is requested
    /// (4000 frames is roughly 16 MB).
    #[serde(default = "default_truncate_frames")]
    pub truncate_frames: i64,

    /// Disable the hook and fall back to the engine's defaults.
    #[serde(default)]
    pub use_sqlite_default: bool,
}

impl Default for WalCheckpointConfig {
    fn default() -> Self {
        Self {
            passive_frames: default_passive_frames(),
            truncate_frames: default_truncate_frames(),
            use_sqlite_default: false,
        }
    }
}

/// Garbage collector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GcConfig {
    /// Maximum rows removed per transaction in each GC category.
    #[serde(default = "default_gc_max_objects")]
    pub max_objects_per_iteration: u64,

    /// Seconds between scheduled GC scans.
    #[serde(default = "default_gc_period")]
    pub processor_period_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_objects_per_iteration: default_gc_max_objects(),
            processor_period_secs: default_gc_period(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_wal_size_limit() -> i64 {
    4 * 1024 * 1024
}

fn default_passive_frames() -> i64 {
    1000
}

fn default_truncate_frames() -> i64 {
    4000
}

fn default_slowlog_ms() -> u64 {
    100
}

fn default_gc_max_objects() -> u64 {
    1000
}

fn default_gc_period() -> u64 {
    3600
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<StoreConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: StoreConfig = serde_yaml::from_str(&contents)?;
    Ok(config)
}
