use std::io::ErrorKind;

use crate::log::header::LOG_HEADER_LEN;
use crate::primitives::io::FileIo;
use crate::types::{be_u32, chained_crc32, Result, SombraError};

/// Size of the framing header in front of every payload.
pub const ENVELOPE_HEADER_LEN: usize = 16;
/// Type tag of a complete envelope.
pub const ENVELOPE_FULL: u8 = 1;
/// Type tag of unwritten space; reading stops here.
pub const ENVELOPE_END: u8 = 0;
/// Largest payload accepted by the writer.
pub const MAX_ENVELOPE_PAYLOAD: usize = 64 * 1024 * 1024;

/// An envelope ready to be written.
#[derive(Debug, Clone)]
pub struct EncodedEnvelope {
    /// Header and payload bytes.
    pub bytes: Vec<u8>,
    /// Checksum the next envelope has to chain from.
    pub checksum: u32,
}

/// Frames `payload` behind an envelope header chained to `previous_checksum`.
pub fn encode_envelope(
    payload_version: u8,
    payload: &[u8],
    previous_checksum: u32,
) -> Result<EncodedEnvelope> {
    if payload.len() > MAX_ENVELOPE_PAYLOAD {
        return Err(SombraError::Invalid("envelope payload too large"));
    }
    let mut bytes = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    bytes.push(ENVELOPE_FULL);
    bytes.push(payload_version);
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&previous_checksum.to_be_bytes());
    let checksum = chained_crc32(previous_checksum, &[&bytes[0..12], payload]);
    bytes.extend_from_slice(&checksum.to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(EncodedEnvelope { bytes, checksum })
}

/// Length on disk of an envelope carrying `payload_len` bytes.
pub const fn envelope_len(payload_len: usize) -> u64 {
    (ENVELOPE_HEADER_LEN + payload_len) as u64
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Offset of the envelope header in its file.
    pub offset: u64,
    /// Version tag of the payload encoding.
    pub payload_version: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Chained checksum of this envelope.
    pub checksum: u32,
}

impl Envelope {
    /// Offset just past this envelope.
    pub fn end_offset(&self) -> u64 {
        self.offset + envelope_len(self.payload.len())
    }
}

/// Forward scanner over the envelopes of one file.
///
/// Scanning ends quietly at the first unwritten, truncated or damaged
/// envelope; [`EnvelopeReader::valid_up_to`] then marks the logical end.
pub struct EnvelopeReader<F: FileIo> {
    io: F,
    offset: u64,
    end: u64,
    expected_previous: Option<u32>,
    valid_up_to: u64,
}

impl<F: FileIo> EnvelopeReader<F> {
    /// Scans a whole file, starting right after its header.
    pub fn from_start(io: F) -> Result<Self> {
        let end = io.len()?;
        Ok(Self::new(io, LOG_HEADER_LEN as u64, end, Some(0)))
    }

    /// Scans from `offset`; the first envelope's chain link is trusted.
    pub fn from_offset(io: F, offset: u64) -> Result<Self> {
        let end = io.len()?;
        let offset = offset.max(LOG_HEADER_LEN as u64);
        let expected = if offset == LOG_HEADER_LEN as u64 {
            Some(0)
        } else {
            None
        };
        Ok(Self::new(io, offset, end, expected))
    }

    fn new(io: F, offset: u64, end: u64, expected_previous: Option<u32>) -> Self {
        Self {
            io,
            offset,
            end,
            expected_previous,
            valid_up_to: offset,
        }
    }

    /// Reads the next envelope, or `None` at the logical end of the file.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        if self.offset + ENVELOPE_HEADER_LEN as u64 > self.end {
            return Ok(self.stop());
        }
        let mut header = [0u8; ENVELOPE_HEADER_LEN];
        if !self.read_or_eof(self.offset, &mut header)? {
            return Ok(self.stop());
        }
        if header[0] != ENVELOPE_FULL {
            return Ok(self.stop());
        }
        let payload_len = be_u32(&header[4..8])? as usize;
        let previous = be_u32(&header[8..12])?;
        let stored = be_u32(&header[12..16])?;
        if payload_len > MAX_ENVELOPE_PAYLOAD
            || self.offset + envelope_len(payload_len) > self.end
        {
            return Ok(self.stop());
        }
        if matches!(self.expected_previous, Some(expected) if expected != previous) {
            return Ok(self.stop());
        }
        let mut payload = vec![0u8; payload_len];
        if !self.read_or_eof(self.offset + ENVELOPE_HEADER_LEN as u64, &mut payload)? {
            return Ok(self.stop());
        }
        if chained_crc32(previous, &[&header[0..12], &payload]) != stored {
            return Ok(self.stop());
        }
        let envelope = Envelope {
            offset: self.offset,
            payload_version: header[1],
            payload,
            checksum: stored,
        };
        self.offset = envelope.end_offset();
        self.valid_up_to = self.offset;
        self.expected_previous = Some(stored);
        Ok(Some(envelope))
    }

    fn read_or_eof(&self, off: u64, dst: &mut [u8]) -> Result<bool> {
        match self.io.read_at(off, dst) {
            Ok(()) => Ok(true),
            Err(SombraError::Io(ref err)) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stop(&mut self) -> Option<Envelope> {
        self.end = self.offset;
        None
    }

    /// Offset up to which envelopes have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    /// Checksum of the last envelope read, if any was read from the file start.
    pub fn last_checksum(&self) -> Option<u32> {
        self.expected_previous
    }

    /// Returns the underlying file.
    pub fn into_inner(self) -> F {
        self.io
    }
}

/// Logical end of a file: where the next envelope goes and what it chains from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogTail {
    /// Offset just past the last valid envelope.
    pub end_offset: u64,
    /// Checksum of the last valid envelope, or 0 for an empty file.
    pub last_checksum: u32,
    /// Number of valid envelopes.
    pub envelopes: u64,
}

/// Scans a file from its header to find its logical end.
pub fn recover_tail<F: FileIo>(io: F) -> Result<LogTail> {
    let mut reader = EnvelopeReader::from_start(io)?;
    let mut envelopes = 0;
    while reader.next_envelope()?.is_some() {
        envelopes += 1;
    }
    Ok(LogTail {
        end_offset: reader.valid_up_to(),
        last_checksum: reader.last_checksum().unwrap_or(0),
        envelopes,
    })
}
