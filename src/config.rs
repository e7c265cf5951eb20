//! TOML-backed settings for the logs and the checkpointer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CHECKPOINT_ENVELOPE_MAX_LEN;
use crate::log::LOG_HEADER_LEN;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Which trigger decides that a checkpoint is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPolicy {
    /// Time or transaction-count threshold, whichever comes first.
    #[default]
    Periodic,
    /// A checkpoint on every evaluation.
    Continuous,
    /// Transaction-log volume threshold.
    Volume,
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Trigger deciding when a checkpoint is due.
    pub policy: CheckpointPolicy,
    /// Time threshold; 0 makes every evaluation due.
    pub interval_time_ms: u64,
    /// Transaction-count threshold.
    pub interval_tx: u64,
    /// Transaction-log volume threshold in bytes.
    pub interval_volume_bytes: u64,
    /// How often the background scheduler evaluates the policy.
    pub scheduler_cadence_ms: u64,
    /// Writes a final checkpoint during shutdown.
    pub checkpoint_on_shutdown: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            policy: CheckpointPolicy::Periodic,
            interval_time_ms: 15 * 60 * 1000,
            interval_tx: 100_000,
            interval_volume_bytes: 250 * MIB,
            scheduler_cadence_ms: 10_000,
            checkpoint_on_shutdown: true,
        }
    }
}

impl CheckpointSettings {
    /// [`interval_time_ms`](Self::interval_time_ms) as a duration.
    pub fn interval_time(&self) -> Duration {
        Duration::from_millis(self.interval_time_ms)
    }

    /// [`scheduler_cadence_ms`](Self::scheduler_cadence_ms) as a duration.
    pub fn scheduler_cadence(&self) -> Duration {
        Duration::from_millis(self.scheduler_cadence_ms)
    }
}

/// `[checkpoint_log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointLogSettings {
    /// A file that would grow past this size is rotated first.
    pub rotation_threshold_bytes: u64,
    /// Number of checkpoint log files retained after pruning.
    pub keep_files: usize,
    /// Reserves file space up front when a file is created.
    pub preallocate: bool,
    /// Block size recorded in headers and used to size preallocation.
    pub segment_block_size: u32,
    /// Version of the first file of a new log.
    pub initial_version: u64,
}

impl Default for CheckpointLogSettings {
    fn default() -> Self {
        Self {
            rotation_threshold_bytes: MIB,
            keep_files: 3,
            preallocate: false,
            segment_block_size: 4 * KIB as u32,
            initial_version: 0,
        }
    }
}

/// `[transaction_log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionLogSettings {
    /// Size at which the current file is rotated before the next append.
    pub rotation_threshold_bytes: u64,
    /// Minimum number of newest files kept when pruning after a checkpoint.
    pub keep_files: usize,
    /// Reserves file space up front when a file is created.
    pub preallocate: bool,
    /// Block size recorded in headers and used to size preallocation.
    pub segment_block_size: u32,
    /// Version of the first file of a new log.
    pub initial_version: u64,
}

impl Default for TransactionLogSettings {
    fn default() -> Self {
        Self {
            rotation_threshold_bytes: 250 * MIB,
            keep_files: 2,
            preallocate: true,
            segment_block_size: 256 * KIB as u32,
            initial_version: 0,
        }
    }
}

/// Bytes reserved up front for a new file.
pub(crate) fn preallocation_len(rotation_threshold: u64, segment_block_size: u32) -> u64 {
    rotation_threshold.max(2 * u64::from(segment_block_size))
}

impl CheckpointLogSettings {
    pub(crate) fn preallocation_len(&self) -> u64 {
        preallocation_len(self.rotation_threshold_bytes, self.segment_block_size)
    }
}

impl TransactionLogSettings {
    pub(crate) fn preallocation_len(&self) -> u64 {
        preallocation_len(self.rotation_threshold_bytes, self.segment_block_size)
    }
}

/// All settings of the subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Checkpoint policy and scheduling.
    pub checkpoint: CheckpointSettings,
    /// Checkpoint log files.
    pub checkpoint_log: CheckpointLogSettings,
    /// Transaction log files.
    pub transaction_log: TransactionLogSettings,
}

impl Config {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, "<inline>")
    }

    fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the settings as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Writes the settings to `path`.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = self.to_toml_string()?;
        fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every minimum; the error names the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cp = &self.checkpoint;
        if cp.interval_tx < 1 {
            return Err(invalid("checkpoint.interval_tx", "must be at least 1"));
        }
        if cp.interval_volume_bytes < KIB {
            return Err(invalid(
                "checkpoint.interval_volume_bytes",
                "must be at least 1 KiB",
            ));
        }
        if cp.scheduler_cadence_ms == 0 {
            return Err(invalid(
                "checkpoint.scheduler_cadence_ms",
                "must be greater than zero",
            ));
        }

        let cl = &self.checkpoint_log;
        let min_rotation = (KIB).max(LOG_HEADER_LEN as u64 + 2 * CHECKPOINT_ENVELOPE_MAX_LEN);
        if cl.rotation_threshold_bytes < min_rotation {
            return Err(invalid(
                "checkpoint_log.rotation_threshold_bytes",
                "must hold the header and two checkpoint records, and be at least 1 KiB",
            ));
        }
        if cl.keep_files < 1 {
            return Err(invalid("checkpoint_log.keep_files", "must be at least 1"));
        }
        if !cl.segment_block_size.is_power_of_two() {
            return Err(invalid(
                "checkpoint_log.segment_block_size",
                "must be a power of two",
            ));
        }

        let tl = &self.transaction_log;
        if tl.rotation_threshold_bytes < KIB {
            return Err(invalid(
                "transaction_log.rotation_threshold_bytes",
                "must be at least 1 KiB",
            ));
        }
        if tl.keep_files < 1 {
            return Err(invalid("transaction_log.keep_files", "must be at least 1"));
        }
        if !tl.segment_block_size.is_power_of_two() {
            return Err(invalid(
                "transaction_log.segment_block_size",
                "must be a power of two",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { key, reason }
}

/// Failures while loading, validating or writing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for these settings.
    #[error("failed to parse config {origin}: {source}")]
    Parse {
        /// File path, or `<inline>` for parsed text.
        origin: String,
        /// Parser failure.
        source: toml::de::Error,
    },
    /// The settings could not be rendered as TOML.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Serializer failure.
        source: toml::ser::Error,
    },
    /// The file could not be written.
    #[error("failed to write config {path}: {source}")]
    Write {
        /// File that was written.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// A value fails validation.
    #[error("invalid setting {key}: {reason}")]
    Invalid {
        /// Dotted key of the setting.
        key: &'static str,
        /// What the value has to satisfy.
        reason: &'static str,
    },
}
