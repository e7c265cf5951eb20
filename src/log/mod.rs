//! On-disk building blocks shared by the transaction and checkpoint logs:
//! the file header, envelope framing, and version-numbered file naming.

mod envelope;
mod files;
mod header;

pub use envelope::{
    encode_envelope, envelope_len, recover_tail, EncodedEnvelope, Envelope, EnvelopeReader,
    LogTail, ENVELOPE_END, ENVELOPE_FULL, ENVELOPE_HEADER_LEN, MAX_ENVELOPE_PAYLOAD,
};
pub use files::LogFilesHelper;
pub use header::{LogHeader, LogKind, LOG_FORMAT_VERSION, LOG_HEADER_LEN, LOG_MAGIC};

use std::sync::Arc;

use crate::checkpoint::metrics::{CheckpointMetrics, NoopMetrics};
use crate::health::DatabaseHealth;
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::native::{platform_native_access, NativeAccess};
use crate::types::Result;

/// Collaborators shared by the log stores.
#[derive(Clone)]
pub struct LogDependencies {
    /// OS file hints.
    pub native: Arc<dyn NativeAccess>,
    /// Health flag panicked by failed forces.
    pub health: Arc<DatabaseHealth>,
    /// Counters.
    pub metrics: Arc<dyn CheckpointMetrics>,
}

impl Default for LogDependencies {
    fn default() -> Self {
        Self {
            native: platform_native_access(),
            health: Arc::new(DatabaseHealth::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl LogDependencies {
    /// Replaces the native access implementation.
    pub fn with_native(mut self, native: Arc<dyn NativeAccess>) -> Self {
        self.native = native;
        self
    }

    /// Replaces the health flag.
    pub fn with_health(mut self, health: Arc<DatabaseHealth>) -> Self {
        self.health = health;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CheckpointMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Generates the identity written into every header of a new log directory.
pub fn generate_store_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Adopts the store id of the newest readable file, or mints a new one.
pub(crate) fn discover_store_id(files: &LogFilesHelper, kind: LogKind) -> Result<u64> {
    for (_, path) in files.matched_files()?.into_iter().rev() {
        let io = StdFileIo::open(&path, OpenMode::ReadOnly)?;
        if io.len()? < LOG_HEADER_LEN as u64 {
            continue;
        }
        if let Ok(header) = LogHeader::read_from(&io) {
            if header.kind == kind {
                return Ok(header.store_id);
            }
        }
    }
    Ok(generate_store_id())
}

/// True if the file for `version` is too short to hold a header, which is
/// what a crash between creating a file and writing its header leaves.
pub(crate) fn header_missing(files: &LogFilesHelper, version: u64) -> Result<bool> {
    let io = StdFileIo::open(files.path_for(version), OpenMode::ReadOnly)?;
    Ok(io.len()? < LOG_HEADER_LEN as u64)
}
