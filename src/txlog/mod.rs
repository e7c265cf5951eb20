//! Rotating, version-numbered transaction log.
//!
//! The storage engine appends transactions through [`TransactionLogFile`];
//! the checkpointer reads its volume counter and prunes files that a
//! checkpoint made obsolete.

mod reader;
mod readers;

pub use reader::{LogEntry, LogReadHandle, TransactionLogReader, TX_PAYLOAD_VERSION};
pub use readers::{ExternalReaderHandle, ExternalReaders};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::TransactionLogSettings;
use crate::log::{
    discover_store_id, encode_envelope, header_missing, EnvelopeReader, LogDependencies,
    LogFilesHelper, LogHeader, LogKind, LOG_HEADER_LEN,
};
use crate::primitives::concurrency::ForceBatcher;
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::native::{advise_quietly, evict_quietly, preallocate_or_extend};
use crate::types::{LogPosition, Result, SombraError, BASE_TX_ID};

use reader::{decode_entry, encode_entry};

/// File name prefix of transaction log files.
pub const TRANSACTION_LOG_BASE_NAME: &str = "txlog";

struct WriterState {
    version: u64,
    io: StdFileIo,
    position: u64,
    last_checksum: u32,
    last_tx_id: i64,
}

/// The transaction log of one database directory.
pub struct TransactionLogFile {
    files: LogFilesHelper,
    settings: TransactionLogSettings,
    store_id: u64,
    deps: LogDependencies,
    writer: Mutex<WriterState>,
    forces: ForceBatcher,
    readers: ExternalReaders,
    appended_bytes: AtomicU64,
}

impl TransactionLogFile {
    /// Opens the log in `dir` with default collaborators.
    pub fn open(dir: impl AsRef<Path>, settings: TransactionLogSettings) -> Result<Self> {
        Self::open_with(dir, settings, LogDependencies::default())
    }

    /// Opens the log in `dir`, creating the first file when none exists.
    /// Writing continues at the logical end of the highest version.
    pub fn open_with(
        dir: impl AsRef<Path>,
        settings: TransactionLogSettings,
        deps: LogDependencies,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let files = LogFilesHelper::new(dir, TRANSACTION_LOG_BASE_NAME);
        let store_id = discover_store_id(&files, LogKind::Transaction)?;
        let writer = match files.highest_version()? {
            Some(version) if header_missing(&files, version)? => {
                let previous = previous_committed_tx_id(&files, store_id, version)?;
                warn!(version, previous, "txlog.open.rewrite_header");
                create_file(&files, &settings, &deps, store_id, version, previous)?
            }
            Some(version) => open_writer(&files, store_id, version)?,
            None => create_file(
                &files,
                &settings,
                &deps,
                store_id,
                settings.initial_version,
                BASE_TX_ID,
            )?,
        };
        info!(
            dir = %dir.display(),
            version = writer.version,
            position = writer.position,
            store_id,
            "txlog.open"
        );
        Ok(Self {
            files,
            settings,
            store_id,
            deps,
            writer: Mutex::new(writer),
            forces: ForceBatcher::new(),
            readers: ExternalReaders::new(),
            appended_bytes: AtomicU64::new(0),
        })
    }

    /// Identity written into every header of this log.
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Directory holding the log files.
    pub fn dir(&self) -> &Path {
        self.files.dir()
    }

    /// Settings the log was opened with.
    pub fn settings(&self) -> &TransactionLogSettings {
        &self.settings
    }

    /// Collaborators shared with the checkpointer.
    pub fn dependencies(&self) -> &LogDependencies {
        &self.deps
    }

    /// Version currently being written.
    pub fn current_version(&self) -> u64 {
        self.writer.lock().version
    }

    /// Where the next entry will be written.
    pub fn current_position(&self) -> LogPosition {
        let writer = self.writer.lock();
        LogPosition::new(writer.version, writer.position)
    }

    /// Id of the last appended transaction, or the one recorded in the
    /// current file's header if nothing was appended to it.
    pub fn last_appended_tx_id(&self) -> i64 {
        self.writer.lock().last_tx_id
    }

    /// Envelope bytes appended since the log was opened. Never reset,
    /// rotation included.
    pub fn appended_bytes(&self) -> u64 {
        self.appended_bytes.load(Ordering::Acquire)
    }

    /// Returns true once the current file reached the rotation threshold.
    pub fn rotation_needed(&self) -> bool {
        self.writer.lock().position >= self.settings.rotation_threshold_bytes
    }

    /// Appends a transaction, rotating first when the current file is full.
    ///
    /// Returns the position of the entry. The entry is not durable until
    /// [`force_after_append`](Self::force_after_append) returns.
    pub fn append(&self, payload: &[u8], tx_id: i64) -> Result<LogPosition> {
        self.deps.health.assert_healthy()?;
        let entry = encode_entry(tx_id, payload);
        let mut writer = self.writer.lock();
        if writer.position >= self.settings.rotation_threshold_bytes {
            self.rotate_locked(&mut writer)?;
        }
        let encoded = encode_envelope(TX_PAYLOAD_VERSION, &entry, writer.last_checksum)?;
        let offset = writer.position;
        writer.io.write_at(offset, &encoded.bytes)?;
        let len = encoded.bytes.len() as u64;
        writer.position += len;
        writer.last_checksum = encoded.checksum;
        writer.last_tx_id = tx_id;
        self.appended_bytes.fetch_add(len, Ordering::AcqRel);
        Ok(LogPosition::new(writer.version, offset))
    }

    /// Makes everything appended so far durable.
    ///
    /// Callers arriving while a flush is running wait for the next flush
    /// instead of issuing their own.
    pub fn force_after_append(&self) -> Result<()> {
        self.deps.health.assert_healthy()?;
        let flushed = self.forces.force_with(|| {
            self.deps.health.assert_healthy()?;
            let io = self.writer.lock().io.clone();
            io.sync_all().map_err(|err| {
                self.deps.health.panic(&err);
                err
            })
        })?;
        self.deps.metrics.transaction_log_forced(!flushed);
        if !flushed {
            self.deps.health.assert_healthy()?;
        }
        Ok(())
    }

    /// Starts a new file regardless of the current size.
    pub fn rotate(&self) -> Result<LogPosition> {
        let mut writer = self.writer.lock();
        self.rotate_locked(&mut writer)?;
        Ok(LogPosition::new(writer.version, writer.position))
    }

    fn rotate_locked(&self, writer: &mut WriterState) -> Result<()> {
        self.deps.health.assert_healthy()?;
        writer.io.truncate(writer.position)?;
        if let Err(err) = writer.io.sync_all() {
            self.deps.health.panic(&err);
            return Err(err);
        }
        evict_quietly(self.deps.native.as_ref(), &writer.io);
        let next = writer.version + 1;
        let fresh = create_file(
            &self.files,
            &self.settings,
            &self.deps,
            self.store_id,
            next,
            writer.last_tx_id,
        )?;
        let previous = std::mem::replace(writer, fresh);
        self.deps.metrics.transaction_log_rotated();
        info!(
            from = previous.version,
            to = next,
            closed_at = previous.position,
            last_tx_id = previous.last_tx_id,
            "txlog.rotate"
        );
        Ok(())
    }

    /// Drops preallocated space past the logical end of the current file.
    pub fn truncate(&self) -> Result<()> {
        let writer = self.writer.lock();
        writer.io.truncate(writer.position)?;
        debug!(version = writer.version, position = writer.position, "txlog.truncate");
        Ok(())
    }

    /// Cuts the log back to `position`, deleting every later version.
    ///
    /// Fails when `position` lies in a version newer than the current one,
    /// precedes `last_closed` (already-applied transactions), or does not
    /// fall on an entry boundary.
    pub fn truncate_to(&self, position: LogPosition, last_closed: LogPosition) -> Result<()> {
        self.deps.health.assert_healthy()?;
        let mut writer = self.writer.lock();
        if position.log_version > writer.version {
            return Err(SombraError::InvalidOwned(format!(
                "cannot truncate to {position}: current log version is {}",
                writer.version
            )));
        }
        if position < last_closed {
            return Err(SombraError::InvalidOwned(format!(
                "cannot truncate to {position}: it precedes the last closed transaction at {last_closed}"
            )));
        }
        let target = if position.log_version == writer.version {
            writer.io.clone()
        } else {
            LogReadHandle::open(&self.files, position.log_version, self.store_id)?;
            StdFileIo::open(self.files.path_for(position.log_version), OpenMode::Existing)?
        };
        if !is_entry_boundary(target.clone(), position.byte_offset)? {
            return Err(SombraError::InvalidOwned(format!(
                "cannot truncate to {position}: not an entry boundary"
            )));
        }
        target.truncate(position.byte_offset)?;
        target.sync_all()?;
        let newer: Vec<u64> = self
            .files
            .matched_versions()?
            .into_iter()
            .filter(|v| *v > position.log_version)
            .collect();
        *writer = open_writer(&self.files, self.store_id, position.log_version)?;
        for version in &newer {
            fs::remove_file(self.files.path_for(*version))?;
        }
        info!(%position, removed = newer.len(), "txlog.truncate_to");
        Ok(())
    }

    /// Path of the file for `version`; it may not exist.
    pub fn get_log_file_for_version(&self, version: u64) -> PathBuf {
        self.files.path_for(version)
    }

    /// Returns true if a file exists for `version`.
    pub fn version_exists(&self, version: u64) -> bool {
        self.files.exists(version)
    }

    /// Highest version on disk, or `None` if there are no log files.
    pub fn highest_log_version(&self) -> Result<Option<u64>> {
        self.files.highest_version()
    }

    /// Lowest version on disk, or `None` if there are no log files.
    pub fn lowest_log_version(&self) -> Result<Option<u64>> {
        self.files.lowest_version()
    }

    /// Every log file, ordered by version.
    pub fn matched_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        self.files.matched_files()
    }

    /// Header of `version`, verified against this store.
    pub fn read_header(&self, version: u64) -> Result<LogHeader> {
        Ok(*self.open_for_version(version)?.header())
    }

    /// Opens `version` for random access after verifying its header.
    pub fn open_for_version(&self, version: u64) -> Result<LogReadHandle> {
        LogReadHandle::open(&self.files, version, self.store_id)
    }

    /// Reader starting at `position` that continues across later versions.
    pub fn get_reader(&self, position: LogPosition) -> Result<TransactionLogReader> {
        TransactionLogReader::open(self.files.clone(), self.store_id, position)
    }

    /// True if `version` holds at least one entry, whatever its physical size.
    pub fn has_any_entries(&self, version: u64) -> Result<bool> {
        let handle = self.open_for_version(version)?;
        let mut envelopes = EnvelopeReader::from_start(handle.io().clone())?;
        Ok(envelopes.next_envelope()?.is_some())
    }

    /// Moves the log files of `other_dir` into this log, numbered after the
    /// current highest version in their original order. Writing continues
    /// in the new highest file. Returns the assigned versions.
    pub fn combine(&self, other_dir: impl AsRef<Path>) -> Result<Vec<u64>> {
        let other_dir = other_dir.as_ref();
        let mut writer = self.writer.lock();
        let source = LogFilesHelper::new(other_dir, TRANSACTION_LOG_BASE_NAME);
        let mut highest = self.files.highest_version()?;
        // Validate every source before the first one is moved in.
        let mut planned = Vec::new();
        for (source_version, path) in source.matched_files()? {
            let header = LogHeader::read_from(&StdFileIo::open(&path, OpenMode::ReadOnly)?)?;
            if header.kind != LogKind::Transaction {
                return Err(SombraError::Corruption("combined file is not a transaction log"));
            }
            let version = highest.map_or(self.settings.initial_version, |h| h + 1);
            highest = Some(version);
            if self.files.exists(version) {
                return Err(SombraError::InvalidOwned(format!(
                    "combine target version {version} already exists"
                )));
            }
            planned.push((source_version, path, header, version));
        }
        let mut assigned = Vec::with_capacity(planned.len());
        for (source_version, path, mut header, version) in planned {
            let target = self.files.path_for(version);
            move_file(&path, &target)?;
            let io = StdFileIo::open(&target, OpenMode::Existing)?;
            header.log_version = version;
            header.store_id = self.store_id;
            header.write_to(&io)?;
            io.sync_all()?;
            debug!(source_version, version, "txlog.combine.file");
            assigned.push(version);
        }
        if let Some(highest) = highest {
            if highest != writer.version {
                writer.io.truncate(writer.position)?;
                writer.io.sync_all()?;
                *writer = open_writer(&self.files, self.store_id, highest)?;
            }
        }
        info!(
            from = %other_dir.display(),
            files = assigned.len(),
            highest = ?highest,
            "txlog.combine"
        );
        Ok(assigned)
    }

    /// Registers readers that keep their versions from being pruned.
    pub fn register_external_readers<I>(&self, readers: I)
    where
        I: IntoIterator<Item = (u64, Arc<dyn ExternalReaderHandle>)>,
    {
        self.readers.register(readers);
    }

    /// Revokes one registration of `handle` for `version`.
    pub fn unregister_external_reader(
        &self,
        version: u64,
        handle: &Arc<dyn ExternalReaderHandle>,
    ) -> bool {
        self.readers.unregister(version, handle)
    }

    /// Terminates and drops every reader registered strictly below
    /// `below_version`.
    pub fn terminate_external_readers(&self, below_version: u64) -> usize {
        self.readers.terminate_below(below_version)
    }

    /// Registered external readers.
    pub fn external_readers(&self) -> &ExternalReaders {
        &self.readers
    }

    /// Deletes files made obsolete by a checkpoint at `checkpoint_position`.
    ///
    /// The newest `keep_files` files, the current file, files at or above
    /// the checkpoint's version, and files with external readers survive.
    pub fn prune(&self, checkpoint_position: LogPosition) -> Result<Vec<u64>> {
        let current = self.current_version();
        let versions = self.files.matched_versions()?;
        let keep_from = versions.len().saturating_sub(self.settings.keep_files);
        let mut deleted = Vec::new();
        for &version in &versions[..keep_from] {
            if version >= checkpoint_position.log_version || version >= current {
                break;
            }
            if self.readers.contains(version) {
                debug!(version, "txlog.prune.skip_reader");
                continue;
            }
            match fs::remove_file(self.files.path_for(version)) {
                Ok(()) => deleted.push(version),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(version, error = %err, "txlog.prune.failed");
                    return Err(err.into());
                }
            }
        }
        if !deleted.is_empty() {
            self.deps.metrics.transaction_log_pruned(deleted.len() as u64);
            info!(
                checkpoint = %checkpoint_position,
                deleted = ?deleted,
                "txlog.prune"
            );
        }
        Ok(deleted)
    }
}

fn create_file(
    files: &LogFilesHelper,
    settings: &TransactionLogSettings,
    deps: &LogDependencies,
    store_id: u64,
    version: u64,
    previous_committed_tx_id: i64,
) -> Result<WriterState> {
    let path = files.path_for(version);
    let io = StdFileIo::open(&path, OpenMode::Create)?;
    // A file shorter than a header was never completed and is rewritten.
    if io.len()? >= LOG_HEADER_LEN as u64 {
        return Err(SombraError::InvalidOwned(format!(
            "log version {version} already exists at {}",
            path.display()
        )));
    }
    let header = LogHeader {
        kind: LogKind::Transaction,
        log_version: version,
        previous_committed_tx_id,
        store_id,
        segment_block_size: settings.segment_block_size,
    };
    header.write_to(&io)?;
    if settings.preallocate {
        preallocate_or_extend(deps.native.as_ref(), &io, settings.preallocation_len())?;
    }
    advise_quietly(deps.native.as_ref(), &io);
    io.sync_all()?;
    Ok(WriterState {
        version,
        io,
        position: LOG_HEADER_LEN as u64,
        last_checksum: 0,
        last_tx_id: previous_committed_tx_id,
    })
}

/// Last transaction id written before `version`, taken from the version
/// right below it when that file exists.
fn previous_committed_tx_id(files: &LogFilesHelper, store_id: u64, version: u64) -> Result<i64> {
    match version.checked_sub(1) {
        Some(prior) if files.exists(prior) => Ok(open_writer(files, store_id, prior)?.last_tx_id),
        _ => Ok(BASE_TX_ID),
    }
}

fn open_writer(files: &LogFilesHelper, store_id: u64, version: u64) -> Result<WriterState> {
    let io = StdFileIo::open(files.path_for(version), OpenMode::Existing)?;
    let header = LogHeader::read_from(&io)?;
    header.check_owner(LogKind::Transaction, store_id)?;
    let mut envelopes = EnvelopeReader::from_start(io.clone())?;
    let mut last_tx_id = header.previous_committed_tx_id;
    while let Some(envelope) = envelopes.next_envelope()? {
        last_tx_id = decode_entry(version, envelope)?.tx_id;
    }
    Ok(WriterState {
        version,
        io,
        position: envelopes.valid_up_to(),
        last_checksum: envelopes.last_checksum().unwrap_or(0),
        last_tx_id,
    })
}

fn is_entry_boundary(io: StdFileIo, offset: u64) -> Result<bool> {
    if offset == LOG_HEADER_LEN as u64 {
        return Ok(true);
    }
    let mut envelopes = EnvelopeReader::from_start(io)?;
    while let Some(envelope) = envelopes.next_envelope()? {
        let end = envelope.end_offset();
        if end == offset {
            return Ok(true);
        }
        if end > offset {
            return Ok(false);
        }
    }
    Ok(false)
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(SombraError::InvalidOwned(format!(
            "refusing to overwrite {}",
            to.display()
        )));
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
