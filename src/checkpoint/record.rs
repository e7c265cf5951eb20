use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::log::envelope_len;
use crate::types::{
    be_i64, be_u16, be_u64, KernelVersion, LogPosition, Result, SombraError, TransactionId,
    BASE_APPEND_INDEX, UNKNOWN_CONSENSUS_INDEX,
};

/// Bytes reserved for the reason text; longer reasons are cut.
pub const REASON_CAPACITY: usize = 120;

/// Oldest record format: no kernel versions, consensus or append index.
pub const CHECKPOINT_FORMAT_V1: u8 = 1;
/// Adds kernel versions and the consensus index.
pub const CHECKPOINT_FORMAT_V2: u8 = 2;
/// Adds the append index.
pub const CHECKPOINT_FORMAT_V3: u8 = 3;
/// Format written by this build.
pub const CHECKPOINT_FORMAT_CURRENT: u8 = CHECKPOINT_FORMAT_V3;

const REASON_FIELD_LEN: usize = 2 + REASON_CAPACITY;

/// Encoded payload size of a record in `format`.
pub const fn payload_len(format: u8) -> usize {
    match format {
        CHECKPOINT_FORMAT_V1 => 8 * 6 + REASON_FIELD_LEN,
        CHECKPOINT_FORMAT_V2 => 1 + 8 * 3 + 1 + 8 * 4 + REASON_FIELD_LEN,
        _ => 1 + 8 * 3 + 1 + 8 * 5 + REASON_FIELD_LEN,
    }
}

/// Largest checkpoint envelope on disk, header included.
pub const CHECKPOINT_ENVELOPE_MAX_LEN: u64 = envelope_len(payload_len(CHECKPOINT_FORMAT_V3));

/// A durable recovery point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Last transaction covered by the checkpoint.
    pub transaction_id: TransactionId,
    /// Append index at the checkpoint, [`BASE_APPEND_INDEX`] for old records.
    pub append_index: i64,
    /// Kernel version the checkpoint was written with.
    pub kernel_version: KernelVersion,
    /// Where recovery resumes in the transaction log.
    pub transaction_log_position: LogPosition,
    /// Where this record sits in the checkpoint log; set on append and read.
    pub checkpoint_log_position: LogPosition,
    /// Wall-clock time of the checkpoint in milliseconds since the epoch.
    pub timestamp_millis: i64,
    /// Why the checkpoint happened.
    pub reason: String,
}

impl CheckpointRecord {
    /// Creates a record stamped with the current time.
    pub fn new(
        transaction_id: TransactionId,
        append_index: i64,
        kernel_version: KernelVersion,
        transaction_log_position: LogPosition,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            append_index,
            kernel_version,
            transaction_log_position,
            checkpoint_log_position: LogPosition::default(),
            timestamp_millis: now_millis(),
            reason: truncate_reason(reason.into()),
        }
    }

    /// [`timestamp_millis`](Self::timestamp_millis) as a system time.
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp_millis.max(0) as u64)
    }

    /// Serializes the record in `format`; fields the format lacks are dropped.
    pub fn encode(&self, format: u8) -> Result<Vec<u8>> {
        if !(CHECKPOINT_FORMAT_V1..=CHECKPOINT_FORMAT_V3).contains(&format) {
            return Err(SombraError::Invalid("unknown checkpoint record format"));
        }
        let mut buf = Vec::with_capacity(payload_len(format));
        let tx = &self.transaction_id;
        if format >= CHECKPOINT_FORMAT_V2 {
            buf.push(self.kernel_version.as_u8());
        }
        buf.extend_from_slice(&tx.id.to_be_bytes());
        buf.extend_from_slice(&tx.checksum.to_be_bytes());
        if format >= CHECKPOINT_FORMAT_V2 {
            buf.push(tx.kernel_version.as_u8());
        }
        buf.extend_from_slice(&tx.commit_timestamp.to_be_bytes());
        if format >= CHECKPOINT_FORMAT_V2 {
            buf.extend_from_slice(&tx.consensus_index.to_be_bytes());
        }
        if format >= CHECKPOINT_FORMAT_V3 {
            buf.extend_from_slice(&self.append_index.to_be_bytes());
        }
        buf.extend_from_slice(&self.transaction_log_position.log_version.to_be_bytes());
        buf.extend_from_slice(&self.transaction_log_position.byte_offset.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        let reason = reason_bytes(&self.reason);
        buf.extend_from_slice(&(reason.len() as u16).to_be_bytes());
        buf.extend_from_slice(reason);
        buf.resize(payload_len(format), 0);
        Ok(buf)
    }

    /// Parses a payload written in `format`, defaulting absent fields.
    pub fn decode(format: u8, payload: &[u8], position: LogPosition) -> Result<Self> {
        if !(CHECKPOINT_FORMAT_V1..=CHECKPOINT_FORMAT_V3).contains(&format) {
            return Err(SombraError::Corruption("unknown checkpoint record format"));
        }
        if payload.len() != payload_len(format) {
            return Err(SombraError::Corruption("checkpoint record has wrong length"));
        }
        let mut cursor = Cursor { src: payload, at: 0 };
        let legacy = format < CHECKPOINT_FORMAT_V2;
        let kernel_version = if legacy {
            KernelVersion::OLDEST
        } else {
            KernelVersion::from_u8(cursor.u8()?)?
        };
        let id = cursor.i64()?;
        let checksum = cursor.u64()?;
        let tx_kernel_version = if legacy {
            KernelVersion::OLDEST
        } else {
            KernelVersion::from_u8(cursor.u8()?)?
        };
        let commit_timestamp = cursor.i64()?;
        let consensus_index = if legacy {
            UNKNOWN_CONSENSUS_INDEX
        } else {
            cursor.i64()?
        };
        let append_index = if format >= CHECKPOINT_FORMAT_V3 {
            cursor.i64()?
        } else {
            BASE_APPEND_INDEX
        };
        let log_version = cursor.u64()?;
        let byte_offset = cursor.u64()?;
        let timestamp_millis = cursor.i64()?;
        let reason_len = cursor.u16()? as usize;
        if reason_len > REASON_CAPACITY {
            return Err(SombraError::Corruption("checkpoint reason too long"));
        }
        let reason = String::from_utf8_lossy(cursor.take(reason_len)?).into_owned();
        Ok(Self {
            transaction_id: TransactionId::new(
                id,
                checksum,
                tx_kernel_version,
                commit_timestamp,
                consensus_index,
            ),
            append_index,
            kernel_version,
            transaction_log_position: LogPosition::new(log_version, byte_offset),
            checkpoint_log_position: position,
            timestamp_millis,
            reason,
        })
    }
}

struct Cursor<'a> {
    src: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.at + len;
        let slice = self
            .src
            .get(self.at..end)
            .ok_or(SombraError::Corruption("checkpoint record truncated"))?;
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        be_u16(self.take(2)?)
    }

    fn u64(&mut self) -> Result<u64> {
        be_u64(self.take(8)?)
    }

    fn i64(&mut self) -> Result<i64> {
        be_i64(self.take(8)?)
    }
}

fn reason_bytes(reason: &str) -> &[u8] {
    let bytes = reason.as_bytes();
    &bytes[..bytes.len().min(REASON_CAPACITY)]
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > REASON_CAPACITY {
        let mut cut = REASON_CAPACITY;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
