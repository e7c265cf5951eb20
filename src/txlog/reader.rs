use tracing::debug;

use crate::log::{Envelope, EnvelopeReader, LogFilesHelper, LogHeader, LogKind};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::types::{be_i64, LogPosition, Result, SombraError};

/// Payload encoding of transaction entries.
pub const TX_PAYLOAD_VERSION: u8 = 1;

/// One transaction as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Where the entry's envelope starts.
    pub position: LogPosition,
    /// Transaction id the entry was appended with.
    pub tx_id: i64,
    /// Opaque transaction bytes.
    pub payload: Vec<u8>,
}

pub(crate) fn encode_entry(tx_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&tx_id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn decode_entry(log_version: u64, envelope: Envelope) -> Result<LogEntry> {
    if envelope.payload_version != TX_PAYLOAD_VERSION {
        return Err(SombraError::Corruption("unknown transaction payload version"));
    }
    if envelope.payload.len() < 8 {
        return Err(SombraError::Corruption("transaction entry truncated"));
    }
    let tx_id = be_i64(&envelope.payload[0..8])?;
    Ok(LogEntry {
        position: LogPosition::new(log_version, envelope.offset),
        tx_id,
        payload: envelope.payload[8..].to_vec(),
    })
}

/// A transaction log file opened for reading, header already verified.
pub struct LogReadHandle {
    version: u64,
    header: LogHeader,
    io: StdFileIo,
}

impl LogReadHandle {
    /// Opens `version`; a missing or unreadable header closes the file again
    /// and fails.
    pub(crate) fn open(files: &LogFilesHelper, version: u64, store_id: u64) -> Result<Self> {
        let io = StdFileIo::open(files.path_for(version), OpenMode::ReadOnly)?;
        // `io` is dropped, closing the descriptor, on any error below.
        let header = LogHeader::read_from(&io)?;
        header.check_owner(LogKind::Transaction, store_id)?;
        if header.log_version != version {
            return Err(SombraError::Corruption("log header version does not match file name"));
        }
        Ok(Self {
            version,
            header,
            io,
        })
    }

    /// Version of the opened file.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Verified header of the file.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Physical length of the file.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// True if the file holds nothing past its header.
    pub fn is_empty(&self) -> Result<bool> {
        self.io.is_empty()
    }

    /// Reads raw bytes at `off`.
    pub fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.io.read_at(off, dst)
    }

    /// Underlying file.
    pub fn io(&self) -> &StdFileIo {
        &self.io
    }
}

/// Reads entries from a position onward, continuing into later versions
/// when a file is exhausted.
pub struct TransactionLogReader {
    files: LogFilesHelper,
    store_id: u64,
    version: u64,
    envelopes: EnvelopeReader<StdFileIo>,
}

impl TransactionLogReader {
    pub(crate) fn open(files: LogFilesHelper, store_id: u64, position: LogPosition) -> Result<Self> {
        let handle = LogReadHandle::open(&files, position.log_version, store_id)?;
        let envelopes = EnvelopeReader::from_offset(handle.io, position.byte_offset)?;
        Ok(Self {
            files,
            store_id,
            version: position.log_version,
            envelopes,
        })
    }

    /// Position of the next entry to be read.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.version, self.envelopes.valid_up_to())
    }

    /// Returns the next entry, or `None` once the newest file is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        loop {
            if let Some(envelope) = self.envelopes.next_envelope()? {
                return decode_entry(self.version, envelope).map(Some);
            }
            let next = self.version + 1;
            if !self.files.exists(next) {
                return Ok(None);
            }
            let handle = LogReadHandle::open(&self.files, next, self.store_id)?;
            debug!(from = self.version, to = next, "txlog.reader.bridge");
            self.envelopes = EnvelopeReader::from_start(handle.io)?;
            self.version = next;
        }
    }
}

impl Iterator for TransactionLogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
