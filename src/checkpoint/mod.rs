//! Checkpointing: the record format, the checkpoint log, the trigger
//! thresholds, the coordinator and its background scheduler.

mod coordinator;
mod log;
pub mod metrics;
mod record;
mod scheduler;
mod threshold;

pub use coordinator::{CheckPointer, CheckpointInfo, StorageEngine, TriggerInfo, SHUTDOWN_WARNING};
pub use log::{CheckpointLogFile, CHECKPOINT_LOG_BASE_NAME};
pub use metrics::{CheckpointMetrics, CounterMetrics, NoopMetrics};
pub use record::{
    payload_len, CheckpointRecord, CHECKPOINT_ENVELOPE_MAX_LEN, CHECKPOINT_FORMAT_CURRENT,
    CHECKPOINT_FORMAT_V1, CHECKPOINT_FORMAT_V2, CHECKPOINT_FORMAT_V3, REASON_CAPACITY,
};
pub use scheduler::CheckpointScheduler;
pub use threshold::{CheckpointThreshold, ThresholdSnapshot};
