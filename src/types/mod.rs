#![forbid(unsafe_code)]

//! Shared value types and the crate error.

use std::fmt;

mod checksum;

pub use checksum::{chained_crc32, crc32, Checksum, Crc32Fast};

/// First transaction id ever handed out by a fresh store.
pub const BASE_TX_ID: i64 = 1;
/// Checksum recorded for [`BASE_TX_ID`].
pub const BASE_TX_CHECKSUM: u64 = 0;
/// Commit timestamp recorded for [`BASE_TX_ID`].
pub const BASE_TX_COMMIT_TIMESTAMP: i64 = 0;
/// Append index used when a record predates append indexes.
pub const BASE_APPEND_INDEX: i64 = 1;
/// Consensus index used when a record carries none.
pub const UNKNOWN_CONSENSUS_INDEX: i64 = -1;

/// A point in a versioned log: file version plus byte offset within that file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct LogPosition {
    /// Version number of the log file.
    pub log_version: u64,
    /// Offset from the start of the file, header included.
    pub byte_offset: u64,
}

impl LogPosition {
    /// Creates a position.
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogPosition{{logVersion={}, byteOffset={}}}",
            self.log_version, self.byte_offset
        )
    }
}

/// Kernel format versions known to this build, oldest first.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum KernelVersion {
    /// Oldest format; records written with it carry no kernel version at all.
    V1 = 1,
    /// Adds consensus indexes to transaction ids.
    V2 = 2,
    /// Adds append indexes.
    V3 = 3,
}

impl KernelVersion {
    /// Oldest version; the default for records that do not name one.
    pub const OLDEST: KernelVersion = KernelVersion::V1;
    /// Version written by this build.
    pub const LATEST: KernelVersion = KernelVersion::V3;

    /// Returns the on-disk tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes an on-disk tag.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(KernelVersion::V1),
            2 => Ok(KernelVersion::V2),
            3 => Ok(KernelVersion::V3),
            _ => Err(SombraError::Corruption("unknown kernel version")),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.as_u8())
    }
}

/// Identity of a committed transaction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TransactionId {
    /// Strictly increasing transaction number.
    pub id: i64,
    /// Checksum of the transaction's log content.
    pub checksum: u64,
    /// Kernel version the transaction was committed with.
    pub kernel_version: KernelVersion,
    /// Commit time in milliseconds since the epoch.
    pub commit_timestamp: i64,
    /// Consensus index, or [`UNKNOWN_CONSENSUS_INDEX`].
    pub consensus_index: i64,
}

impl TransactionId {
    /// Creates a transaction id.
    pub const fn new(
        id: i64,
        checksum: u64,
        kernel_version: KernelVersion,
        commit_timestamp: i64,
        consensus_index: i64,
    ) -> Self {
        Self {
            id,
            checksum,
            kernel_version,
            commit_timestamp,
            consensus_index,
        }
    }

    /// The id a fresh store reports before any transaction commits.
    pub const fn base() -> Self {
        Self::new(
            BASE_TX_ID,
            BASE_TX_CHECKSUM,
            KernelVersion::OLDEST,
            BASE_TX_COMMIT_TIMESTAMP,
            UNKNOWN_CONSENSUS_INDEX,
        )
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransactionId{{id={}, checksum={}, kernelVersion={}, commitTimestamp={}, consensusIndex={}}}",
            self.id, self.checksum, self.kernel_version, self.commit_timestamp, self.consensus_index
        )
    }
}

/// Errors raised by the log and checkpoint subsystem.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk content that cannot be trusted.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument or call sequence.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a computed message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The checkpointer no longer accepts requests.
    #[error("checkpointer has already shut down")]
    ShutDown,
    /// A previous failure left the database unable to write its logs.
    #[error("database panicked: {0}")]
    Panicked(String),
    /// Missing log file or entry.
    #[error("not found")]
    NotFound,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SombraError>;

/// Copies an error so it can be handed to several waiters.
pub(crate) fn clone_error(err: &SombraError) -> SombraError {
    match err {
        SombraError::Io(io_err) => {
            SombraError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        SombraError::Corruption(msg) => SombraError::Corruption(msg),
        SombraError::Invalid(msg) => SombraError::Invalid(msg),
        SombraError::InvalidOwned(msg) => SombraError::InvalidOwned(msg.clone()),
        SombraError::ShutDown => SombraError::ShutDown,
        SombraError::Panicked(msg) => SombraError::Panicked(msg.clone()),
        SombraError::NotFound => SombraError::NotFound,
    }
}

pub(crate) fn be_u64(src: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = src
        .try_into()
        .map_err(|_| SombraError::Corruption("expected 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn be_i64(src: &[u8]) -> Result<i64> {
    Ok(be_u64(src)? as i64)
}

pub(crate) fn be_u32(src: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = src
        .try_into()
        .map_err(|_| SombraError::Corruption("expected 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn be_u16(src: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = src
        .try_into()
        .map_err(|_| SombraError::Corruption("expected 2 bytes"))?;
    Ok(u16::from_be_bytes(bytes))
}
