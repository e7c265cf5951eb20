//! Checkpoint and log counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Observability hooks for checkpoints and the logs they manage.
///
/// Implementations must be cheap; they are called on the checkpoint and
/// force paths.
pub trait CheckpointMetrics: Send + Sync {
    /// A checkpoint acquired the section and started.
    fn checkpoint_started(&self);

    /// A checkpoint record became durable.
    ///
    /// # Parameters
    /// * `flush_micros` - Time spent in the storage flush.
    fn checkpoint_completed(&self, flush_micros: u64);

    /// A request returned without checkpointing.
    ///
    /// # Parameters
    /// * `reason` - `"not_needed"`, `"busy"`, or `"shut_down"`.
    fn checkpoint_skipped(&self, reason: &'static str);

    /// The checkpoint log moved to a new file.
    fn checkpoint_log_rotated(&self);

    /// Checkpoint log files removed by pruning.
    fn checkpoint_log_pruned(&self, files: u64);

    /// The transaction log moved to a new file.
    fn transaction_log_rotated(&self);

    /// Transaction log files removed by pruning.
    fn transaction_log_pruned(&self, files: u64);

    /// A force request on the transaction log.
    ///
    /// # Parameters
    /// * `coalesced` - `true` when another caller's flush covered it.
    fn transaction_log_forced(&self, coalesced: bool);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl CheckpointMetrics for NoopMetrics {
    fn checkpoint_started(&self) {}
    fn checkpoint_completed(&self, _flush_micros: u64) {}
    fn checkpoint_skipped(&self, _reason: &'static str) {}
    fn checkpoint_log_rotated(&self) {}
    fn checkpoint_log_pruned(&self, _files: u64) {}
    fn transaction_log_rotated(&self) {}
    fn transaction_log_pruned(&self, _files: u64) {}
    fn transaction_log_forced(&self, _coalesced: bool) {}
}

/// Atomic counters for every hook.
#[derive(Default)]
pub struct CounterMetrics {
    /// Checkpoints that passed the threshold and began.
    pub checkpoints_started: AtomicU64,
    /// Checkpoints durably recorded.
    pub checkpoints_completed: AtomicU64,
    /// Total time spent in the engine flush.
    pub checkpoint_flush_micros: AtomicU64,
    /// Requests whose threshold was not met.
    pub skipped_not_needed: AtomicU64,
    /// No-wait requests that found a checkpoint running.
    pub skipped_busy: AtomicU64,
    /// Requests after shutdown.
    pub skipped_shut_down: AtomicU64,
    /// Checkpoint log rotations.
    pub checkpoint_log_rotations: AtomicU64,
    /// Checkpoint log files deleted.
    pub checkpoint_log_pruned_files: AtomicU64,
    /// Transaction log rotations.
    pub transaction_log_rotations: AtomicU64,
    /// Transaction log files deleted.
    pub transaction_log_pruned_files: AtomicU64,
    /// Transaction log force calls.
    pub forces: AtomicU64,
    /// Force calls covered by another caller's flush.
    pub coalesced_forces: AtomicU64,
}

impl CheckpointMetrics for CounterMetrics {
    fn checkpoint_started(&self) {
        self.checkpoints_started.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_completed(&self, flush_micros: u64) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_flush_micros
            .fetch_add(flush_micros, Ordering::Relaxed);
    }

    fn checkpoint_skipped(&self, reason: &'static str) {
        let counter = match reason {
            "busy" => &self.skipped_busy,
            "shut_down" => &self.skipped_shut_down,
            _ => &self.skipped_not_needed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_log_rotated(&self) {
        self.checkpoint_log_rotations.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_log_pruned(&self, files: u64) {
        self.checkpoint_log_pruned_files
            .fetch_add(files, Ordering::Relaxed);
    }

    fn transaction_log_rotated(&self) {
        self.transaction_log_rotations
            .fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_log_pruned(&self, files: u64) {
        self.transaction_log_pruned_files
            .fetch_add(files, Ordering::Relaxed);
    }

    fn transaction_log_forced(&self, coalesced: bool) {
        self.forces.fetch_add(1, Ordering::Relaxed);
        if coalesced {
            self.coalesced_forces.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl CounterMetrics {
    /// Completed checkpoints so far.
    pub fn completed(&self) -> u64 {
        self.checkpoints_completed.load(Ordering::Relaxed)
    }
}
