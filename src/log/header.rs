use crate::primitives::io::FileIo;
use crate::types::{be_i64, be_u32, be_u64, crc32, Result, SombraError};

/// Size of the fixed header at the start of every log file.
pub const LOG_HEADER_LEN: usize = 64;
/// Magic bytes identifying a log file.
pub const LOG_MAGIC: [u8; 4] = *b"SOML";
/// Header format written by this build.
pub const LOG_FORMAT_VERSION: u8 = 1;

/// Which store a log file belongs to.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LogKind {
    /// Transaction log file.
    Transaction = 1,
    /// Checkpoint log file.
    Checkpoint = 2,
}

impl LogKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogKind::Transaction),
            2 => Ok(LogKind::Checkpoint),
            _ => Err(SombraError::Corruption("unknown log kind")),
        }
    }
}

/// Decoded log file header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogHeader {
    /// Store the file belongs to.
    pub kind: LogKind,
    /// Version number the file was created with.
    pub log_version: u64,
    /// Last transaction committed before this file was started.
    pub previous_committed_tx_id: i64,
    /// Identity of the log directory that created the file.
    pub store_id: u64,
    /// Block size used to size preallocation.
    pub segment_block_size: u32,
}

impl LogHeader {
    /// Serializes the header, CRC included.
    pub fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4] = LOG_FORMAT_VERSION;
        buf[5] = self.kind as u8;
        buf[8..16].copy_from_slice(&self.log_version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.previous_committed_tx_id.to_be_bytes());
        buf[24..32].copy_from_slice(&self.store_id.to_be_bytes());
        buf[32..36].copy_from_slice(&self.segment_block_size.to_be_bytes());
        let crc = crc32(&[&buf[0..60]]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses a header, rejecting truncated or damaged input.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HEADER_LEN {
            return Err(SombraError::Corruption("log header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(SombraError::Corruption("log header magic mismatch"));
        }
        if src[4] != LOG_FORMAT_VERSION {
            return Err(SombraError::Corruption("unsupported log format version"));
        }
        let stored_crc = be_u32(&src[60..64])?;
        if crc32(&[&src[0..60]]) != stored_crc {
            return Err(SombraError::Corruption("log header crc mismatch"));
        }
        Ok(Self {
            kind: LogKind::from_u8(src[5])?,
            log_version: be_u64(&src[8..16])?,
            previous_committed_tx_id: be_i64(&src[16..24])?,
            store_id: be_u64(&src[24..32])?,
            segment_block_size: be_u32(&src[32..36])?,
        })
    }

    /// Writes the header at offset zero.
    pub fn write_to(&self, io: &dyn FileIo) -> Result<()> {
        io.write_at(0, &self.encode())
    }

    /// Reads the header at offset zero; a short file is corruption.
    pub fn read_from(io: &dyn FileIo) -> Result<Self> {
        if io.len()? < LOG_HEADER_LEN as u64 {
            return Err(SombraError::Corruption("log header truncated"));
        }
        let mut buf = [0u8; LOG_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        Self::decode(&buf)
    }

    /// Fails unless the header was written for `kind` by the store `store_id`.
    pub fn check_owner(&self, kind: LogKind, store_id: u64) -> Result<()> {
        if self.kind != kind {
            return Err(SombraError::Corruption("log file belongs to another log kind"));
        }
        if self.store_id != store_id {
            return Err(SombraError::Corruption("log file belongs to another store"));
        }
        Ok(())
    }
}
