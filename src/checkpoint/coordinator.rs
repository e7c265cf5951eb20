use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::log::CheckpointLogFile;
use crate::checkpoint::metrics::{CheckpointMetrics, NoopMetrics};
use crate::checkpoint::record::CheckpointRecord;
use crate::checkpoint::threshold::{CheckpointThreshold, ThresholdSnapshot};
use crate::config::CheckpointSettings;
use crate::primitives::concurrency::{CheckpointMutex, CheckpointSection, CommitBarrier};
use crate::txlog::TransactionLogFile;
use crate::types::{KernelVersion, LogPosition, Result, SombraError, TransactionId};

/// Message logged when a best-effort request arrives after shutdown.
pub const SHUTDOWN_WARNING: &str = "Checkpoint was requested on already shutdown checkpointer";

/// The storage engine as seen by the checkpointer.
pub trait StorageEngine: Send + Sync {
    /// Flushes every dirty page to stable storage. May block for a long time.
    fn flush_and_force(&self) -> Result<()>;
    /// Last transaction whose commit is complete.
    fn current_durable_transaction_id(&self) -> TransactionId;
    /// Transaction-log position right after that transaction.
    fn current_log_position(&self) -> LogPosition;
    /// Append index of that transaction.
    fn current_append_index(&self) -> i64;
    /// Kernel version the engine runs with.
    fn kernel_version(&self) -> KernelVersion;
}

/// Why a checkpoint was requested; becomes part of the record's reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    description: String,
}

impl TriggerInfo {
    /// Request with a free-form description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Request from the background scheduler.
    pub fn scheduled() -> Self {
        Self::new("Scheduled checkpoint")
    }

    /// Explicit request, e.g. from an administrator.
    pub fn forced(cause: impl AsRef<str>) -> Self {
        Self::new(format!("Forced checkpoint: {}", cause.as_ref()))
    }

    /// Final checkpoint while shutting down.
    pub fn shutdown() -> Self {
        Self::new("Database shutdown")
    }

    /// Text the checkpoint reason starts with.
    pub fn description(&self) -> &str {
        &self.description
    }

    fn reason(&self, threshold: Option<&CheckpointThreshold>) -> String {
        match threshold {
            Some(threshold) => format!("{} for {}", self.description, threshold),
            None => self.description.clone(),
        }
    }
}

/// The last completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Last transaction covered.
    pub highest_observed_closed_transaction: TransactionId,
    /// Where recovery resumes in the transaction log.
    pub transaction_log_position: LogPosition,
    /// Where the record sits in the checkpoint log.
    pub checkpoint_log_position: LogPosition,
    /// Append index at the checkpoint.
    pub append_index: i64,
    /// Kernel version the checkpoint was written with.
    pub kernel_version: KernelVersion,
    /// Checkpoints completed by this checkpointer; 0 when loaded from disk.
    pub checkpoint_count: u64,
    /// When the record was written.
    pub completed_at: SystemTime,
    /// Reason stored with the record.
    pub reason: String,
}

impl CheckpointInfo {
    fn from_record(record: &CheckpointRecord, checkpoint_count: u64) -> Self {
        Self {
            highest_observed_closed_transaction: record.transaction_id,
            transaction_log_position: record.transaction_log_position,
            checkpoint_log_position: record.checkpoint_log_position,
            append_index: record.append_index,
            kernel_version: record.kernel_version,
            checkpoint_count,
            completed_at: record.timestamp(),
            reason: record.reason.clone(),
        }
    }
}

/// Activity baseline the thresholds measure against.
struct Baseline {
    at: Instant,
    tx_id: i64,
    volume: u64,
}

/// What a checkpoint covers; read before the flush.
struct Snapshot {
    transaction_id: TransactionId,
    log_position: LogPosition,
    append_index: i64,
    kernel_version: KernelVersion,
    volume: u64,
}

/// Runs checkpoints: at most one at a time, never after shutdown.
///
/// A checkpoint snapshots the engine's durable state, flushes the engine,
/// appends a [`CheckpointRecord`], then prunes both logs. Commits only
/// interact with it through the [`CommitBarrier`], which is held
/// exclusively for the snapshot alone and released before the flush.
pub struct CheckPointer {
    engine: Arc<dyn StorageEngine>,
    log: CheckpointLogFile,
    transaction_log: Option<Arc<TransactionLogFile>>,
    threshold: CheckpointThreshold,
    settings: CheckpointSettings,
    section: CheckpointMutex,
    barrier: Arc<CommitBarrier>,
    metrics: Arc<dyn CheckpointMetrics>,
    latest: RwLock<Option<CheckpointInfo>>,
    baseline: Mutex<Baseline>,
    completed: AtomicU64,
}

impl CheckPointer {
    /// Creates a checkpointer over `log`, picking up its latest record.
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        log: CheckpointLogFile,
        settings: CheckpointSettings,
    ) -> Result<Self> {
        let latest = log
            .find_latest_checkpoint()?
            .map(|record| CheckpointInfo::from_record(&record, 0));
        let tx_id = latest
            .as_ref()
            .map(|info| info.highest_observed_closed_transaction.id)
            .unwrap_or_else(|| engine.current_durable_transaction_id().id);
        if let Some(info) = &latest {
            info!(
                transaction = info.highest_observed_closed_transaction.id,
                position = %info.checkpoint_log_position,
                "checkpoint.coordinator.recovered"
            );
        }
        Ok(Self {
            engine,
            log,
            transaction_log: None,
            threshold: CheckpointThreshold::from_settings(&settings),
            settings,
            section: CheckpointMutex::new(),
            barrier: Arc::new(CommitBarrier::new()),
            metrics: Arc::new(NoopMetrics),
            latest: RwLock::new(latest),
            baseline: Mutex::new(Baseline {
                at: Instant::now(),
                tx_id,
                volume: 0,
            }),
            completed: AtomicU64::new(0),
        })
    }

    /// Counts volume from `log` and prunes it after every checkpoint.
    pub fn with_transaction_log(mut self, log: Arc<TransactionLogFile>) -> Self {
        self.baseline.get_mut().volume = log.appended_bytes();
        self.transaction_log = Some(log);
        self
    }

    /// Shares the barrier committing threads enter.
    pub fn with_commit_barrier(mut self, barrier: Arc<CommitBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn CheckpointMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replaces the threshold derived from the settings.
    pub fn with_threshold(mut self, threshold: CheckpointThreshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Barrier committers enter around each commit.
    pub fn commit_barrier(&self) -> &Arc<CommitBarrier> {
        &self.barrier
    }

    /// Checkpoint log records are appended to.
    pub fn checkpoint_log(&self) -> &CheckpointLogFile {
        &self.log
    }

    /// Threshold consulted by [`check_point_if_needed`](Self::check_point_if_needed).
    pub fn threshold(&self) -> &CheckpointThreshold {
        &self.threshold
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.section.is_shut_down()
    }

    /// Activity since the last checkpoint.
    pub fn threshold_snapshot(&self) -> ThresholdSnapshot {
        let baseline = self.baseline.lock();
        let current_tx = self.engine.current_durable_transaction_id().id;
        let volume = self
            .transaction_log
            .as_ref()
            .map(|log| log.appended_bytes())
            .unwrap_or(0);
        ThresholdSnapshot {
            elapsed: baseline.at.elapsed(),
            transactions: current_tx.saturating_sub(baseline.tx_id).max(0) as u64,
            bytes: volume.saturating_sub(baseline.volume),
        }
    }

    /// Checkpoints if the threshold says so.
    ///
    /// Returns `None` when not needed or after shutdown; the latter logs a
    /// warning instead of failing.
    pub fn check_point_if_needed(&self, trigger: &TriggerInfo) -> Result<Option<LogPosition>> {
        let section = match self.section.acquire() {
            Ok(section) => section,
            Err(SombraError::ShutDown) => {
                self.warn_shut_down(trigger);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let snapshot = self.threshold_snapshot();
        let Some(fired) = self.threshold.triggered_by(&snapshot) else {
            self.metrics.checkpoint_skipped("not_needed");
            debug!(
                elapsed_ms = snapshot.elapsed.as_millis() as u64,
                transactions = snapshot.transactions,
                bytes = snapshot.bytes,
                "checkpoint.coordinator.not_needed"
            );
            return Ok(None);
        };
        let reason = trigger.reason(Some(fired));
        self.do_checkpoint(&section, reason).map(Some)
    }

    /// Checkpoints unconditionally, waiting for any running checkpoint.
    ///
    /// Fails with [`SombraError::ShutDown`] after shutdown.
    pub fn force_check_point(&self, trigger: &TriggerInfo) -> Result<LogPosition> {
        let section = self.section.acquire()?;
        self.do_checkpoint(&section, trigger.reason(None))
    }

    /// Checkpoints unless another checkpoint is running, in which case it
    /// returns `None` at once. After shutdown it warns and returns `None`.
    pub fn try_check_point_no_wait(&self, trigger: &TriggerInfo) -> Result<Option<LogPosition>> {
        let section = match self.section.try_acquire() {
            Ok(Some(section)) => section,
            Ok(None) => {
                self.metrics.checkpoint_skipped("busy");
                debug!(trigger = trigger.description(), "checkpoint.coordinator.busy");
                return Ok(None);
            }
            Err(SombraError::ShutDown) => {
                self.warn_shut_down(trigger);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.do_checkpoint(&section, trigger.reason(None)).map(Some)
    }

    /// The last completed checkpoint; never blocks on a running one.
    pub fn latest_check_point_info(&self) -> Option<CheckpointInfo> {
        self.latest.read().clone()
    }

    /// Number of checkpoints completed by this checkpointer.
    pub fn checkpoint_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Waits for a running checkpoint, optionally takes a final one, and
    /// stops accepting requests. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        let section = match self.section.acquire() {
            Ok(section) => section,
            Err(SombraError::ShutDown) => return Ok(()),
            Err(err) => return Err(err),
        };
        let result = if self.settings.checkpoint_on_shutdown {
            self.do_checkpoint(&section, TriggerInfo::shutdown().reason(None))
                .map(|_| ())
        } else {
            Ok(())
        };
        section.close();
        info!(
            checkpoints = self.checkpoint_count(),
            ok = result.is_ok(),
            "checkpoint.coordinator.shutdown"
        );
        result
    }

    fn warn_shut_down(&self, trigger: &TriggerInfo) {
        self.metrics.checkpoint_skipped("shut_down");
        warn!(trigger = trigger.description(), "{}", SHUTDOWN_WARNING);
    }

    fn do_checkpoint(&self, _section: &CheckpointSection<'_>, reason: String) -> Result<LogPosition> {
        self.metrics.checkpoint_started();
        debug!(reason = %reason, "checkpoint.coordinator.start");

        let snapshot = self.barrier.exclusive(|| Snapshot {
            transaction_id: self.engine.current_durable_transaction_id(),
            log_position: self.engine.current_log_position(),
            append_index: self.engine.current_append_index(),
            kernel_version: self.engine.kernel_version(),
            volume: self
                .transaction_log
                .as_ref()
                .map(|log| log.appended_bytes())
                .unwrap_or(0),
        });

        let flush_started = Instant::now();
        self.engine.flush_and_force()?;
        if let Some(log) = &self.transaction_log {
            log.force_after_append()?;
        }
        let flush_micros = flush_started.elapsed().as_micros() as u64;

        let mut record = CheckpointRecord::new(
            snapshot.transaction_id,
            snapshot.append_index,
            snapshot.kernel_version,
            snapshot.log_position,
            reason,
        );
        let position = self.log.append(&record)?;
        record.checkpoint_log_position = position;

        if let Err(err) = self.log.prune(position) {
            warn!(error = %err, "checkpoint_log.prune_failed");
        }
        if let Some(log) = &self.transaction_log {
            if let Err(err) = log.prune(snapshot.log_position) {
                warn!(error = %err, "txlog.prune_failed");
            }
        }

        let count = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        *self.latest.write() = Some(CheckpointInfo::from_record(&record, count));
        *self.baseline.lock() = Baseline {
            at: Instant::now(),
            tx_id: snapshot.transaction_id.id,
            volume: snapshot.volume,
        };
        self.metrics.checkpoint_completed(flush_micros);
        info!(
            transaction = snapshot.transaction_id.id,
            tx_log_position = %snapshot.log_position,
            checkpoint_position = %position,
            flush_micros,
            reason = %record.reason,
            "checkpoint.coordinator.complete"
        );
        Ok(position)
    }
}
