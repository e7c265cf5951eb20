use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::checkpoint::record::{CheckpointRecord, CHECKPOINT_FORMAT_CURRENT};
use crate::config::CheckpointLogSettings;
use crate::log::{
    discover_store_id, encode_envelope, envelope_len, header_missing, recover_tail, EnvelopeReader,
    LogDependencies, LogFilesHelper, LogHeader, LogKind, LOG_HEADER_LEN,
};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::native::{evict_quietly, preallocate_or_extend};
use crate::types::{LogPosition, Result, SombraError, BASE_TX_ID};

/// File name prefix of checkpoint log files.
pub const CHECKPOINT_LOG_BASE_NAME: &str = "checkpoint";

struct CheckpointWriter {
    version: u64,
    io: StdFileIo,
    /// Logical end; the physical file may be longer when preallocated.
    position: u64,
    last_checksum: u32,
}

/// Append-only, rotating store of checkpoint records.
pub struct CheckpointLogFile {
    files: LogFilesHelper,
    settings: CheckpointLogSettings,
    store_id: u64,
    deps: LogDependencies,
    writer: Mutex<CheckpointWriter>,
}

impl CheckpointLogFile {
    /// Opens the checkpoint log in `dir` with default collaborators.
    pub fn open(dir: impl AsRef<Path>, settings: CheckpointLogSettings) -> Result<Self> {
        Self::open_with(dir, settings, LogDependencies::default())
    }

    /// Opens the checkpoint log, creating its first file if needed.
    pub fn open_with(
        dir: impl AsRef<Path>,
        settings: CheckpointLogSettings,
        deps: LogDependencies,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let files = LogFilesHelper::new(dir, CHECKPOINT_LOG_BASE_NAME);
        let store_id = discover_store_id(&files, LogKind::Checkpoint)?;
        let writer = match files.highest_version()? {
            Some(version) if header_missing(&files, version)? => {
                warn!(version, "checkpoint_log.open.rewrite_header");
                create(&files, &settings, &deps, store_id, version)?
            }
            Some(version) => reopen(&files, store_id, version)?,
            None => create(&files, &settings, &deps, store_id, settings.initial_version)?,
        };
        debug!(
            dir = %dir.display(),
            version = writer.version,
            position = writer.position,
            "checkpoint_log.open"
        );
        Ok(Self {
            files,
            settings,
            store_id,
            deps,
            writer: Mutex::new(writer),
        })
    }

    /// Identity written into every header of this log.
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Settings the log was opened with.
    pub fn settings(&self) -> &CheckpointLogSettings {
        &self.settings
    }

    /// Version currently appended to.
    pub fn current_version(&self) -> u64 {
        self.writer.lock().version
    }

    /// Where the next record goes.
    pub fn current_position(&self) -> LogPosition {
        let writer = self.writer.lock();
        LogPosition::new(writer.version, writer.position)
    }

    /// Durably appends `record`, rotating first if it would not fit.
    pub fn append(&self, record: &CheckpointRecord) -> Result<LogPosition> {
        self.append_with_format(record, CHECKPOINT_FORMAT_CURRENT)
    }

    /// Appends `record` encoded in an explicit record format.
    pub fn append_with_format(&self, record: &CheckpointRecord, format: u8) -> Result<LogPosition> {
        let payload = record.encode(format)?;
        let mut writer = self.writer.lock();
        let len = envelope_len(payload.len());
        if writer.position > LOG_HEADER_LEN as u64
            && writer.position + len > self.settings.rotation_threshold_bytes
        {
            self.rotate_locked(&mut writer)?;
        }
        self.write_locked(&mut writer, format, &payload)
    }

    fn write_locked(
        &self,
        writer: &mut CheckpointWriter,
        format: u8,
        payload: &[u8],
    ) -> Result<LogPosition> {
        let encoded = encode_envelope(format, payload, writer.last_checksum)?;
        let offset = writer.position;
        writer.io.write_at(offset, &encoded.bytes)?;
        writer.io.sync_all()?;
        writer.position += encoded.bytes.len() as u64;
        writer.last_checksum = encoded.checksum;
        Ok(LogPosition::new(writer.version, offset))
    }

    /// Starts a fresh, empty file regardless of the current size.
    pub fn rotate(&self) -> Result<LogPosition> {
        let mut writer = self.writer.lock();
        self.rotate_locked(&mut writer)?;
        Ok(LogPosition::new(writer.version, writer.position))
    }

    fn rotate_locked(&self, writer: &mut CheckpointWriter) -> Result<()> {
        writer.io.truncate(writer.position)?;
        writer.io.sync_all()?;
        evict_quietly(self.deps.native.as_ref(), &writer.io);
        let next = writer.version + 1;
        let fresh = create(&self.files, &self.settings, &self.deps, self.store_id, next)?;
        let previous = std::mem::replace(writer, fresh);
        self.deps.metrics.checkpoint_log_rotated();
        info!(
            from = previous.version,
            to = next,
            closed_at = previous.position,
            "checkpoint_log.rotate"
        );
        Ok(())
    }

    /// Newest readable record, or `None` for a log without records.
    ///
    /// Files are visited newest first; within a file records are read
    /// forward and the last intact one wins.
    pub fn find_latest_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        for (version, path) in self.files.matched_files()?.into_iter().rev() {
            if let Some(record) = self.read_file(version, &path)?.pop() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Every readable record, oldest first.
    pub fn reachable_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::new();
        for (version, path) in self.files.matched_files()? {
            records.extend(self.read_file(version, &path)?);
        }
        Ok(records)
    }

    fn read_file(&self, version: u64, path: &Path) -> Result<Vec<CheckpointRecord>> {
        let io = StdFileIo::open(path, OpenMode::ReadOnly)?;
        match LogHeader::read_from(&io) {
            Ok(header) if header.kind == LogKind::Checkpoint => {}
            Ok(_) | Err(SombraError::Corruption(_)) => {
                warn!(version, path = %path.display(), "checkpoint_log.bad_header");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        }
        let mut envelopes = EnvelopeReader::from_start(io)?;
        let mut records = Vec::new();
        while let Some(envelope) = envelopes.next_envelope()? {
            let position = LogPosition::new(version, envelope.offset);
            match CheckpointRecord::decode(envelope.payload_version, &envelope.payload, position) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(version, offset = envelope.offset, error = %err, "checkpoint_log.bad_record");
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Deletes old files so that at most `keep_files` remain.
    ///
    /// Only files below the version of `latest` are candidates, and the
    /// current file is never removed.
    pub fn prune(&self, latest: LogPosition) -> Result<Vec<u64>> {
        self.prune_keeping(latest, self.settings.keep_files)
    }

    /// [`prune`](Self::prune) with an explicit retention count.
    pub fn prune_keeping(&self, latest: LogPosition, keep_files: usize) -> Result<Vec<u64>> {
        let current = self.current_version();
        let versions = self.files.matched_versions()?;
        let keep_from = versions.len().saturating_sub(keep_files.max(1));
        let mut deleted = Vec::new();
        for &version in &versions[..keep_from] {
            if version >= latest.log_version || version >= current {
                break;
            }
            match fs::remove_file(self.files.path_for(version)) {
                Ok(()) => deleted.push(version),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !deleted.is_empty() {
            self.deps.metrics.checkpoint_log_pruned(deleted.len() as u64);
            info!(latest = %latest, deleted = ?deleted, "checkpoint_log.prune");
        }
        Ok(deleted)
    }

    /// Checkpoint log files, ordered by version.
    pub fn matched_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        self.files.matched_files()
    }

    /// Logical content length of `version`, header included.
    pub fn logical_len(&self, version: u64) -> Result<u64> {
        {
            let writer = self.writer.lock();
            if writer.version == version {
                return Ok(writer.position);
            }
        }
        let io = StdFileIo::open(self.files.path_for(version), OpenMode::ReadOnly)?;
        Ok(recover_tail(io)?.end_offset)
    }
}

fn create(
    files: &LogFilesHelper,
    settings: &CheckpointLogSettings,
    deps: &LogDependencies,
    store_id: u64,
    version: u64,
) -> Result<CheckpointWriter> {
    let path = files.path_for(version);
    let io = StdFileIo::open(&path, OpenMode::Create)?;
    // A file shorter than a header was never completed and is rewritten.
    if io.len()? >= LOG_HEADER_LEN as u64 {
        return Err(SombraError::InvalidOwned(format!(
            "checkpoint log version {version} already exists at {}",
            path.display()
        )));
    }
    LogHeader {
        kind: LogKind::Checkpoint,
        log_version: version,
        previous_committed_tx_id: BASE_TX_ID,
        store_id,
        segment_block_size: settings.segment_block_size,
    }
    .write_to(&io)?;
    if settings.preallocate {
        preallocate_or_extend(deps.native.as_ref(), &io, settings.preallocation_len())?;
    }
    io.sync_all()?;
    Ok(CheckpointWriter {
        version,
        io,
        position: LOG_HEADER_LEN as u64,
        last_checksum: 0,
    })
}

fn reopen(files: &LogFilesHelper, store_id: u64, version: u64) -> Result<CheckpointWriter> {
    let io = StdFileIo::open(files.path_for(version), OpenMode::Existing)?;
    LogHeader::read_from(&io)?.check_owner(LogKind::Checkpoint, store_id)?;
    let tail = recover_tail(io.clone())?;
    Ok(CheckpointWriter {
        version,
        io,
        position: tail.end_offset,
        last_checksum: tail.last_checksum,
    })
}
