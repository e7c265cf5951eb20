use std::fmt;
use std::time::Duration;

use crate::config::{CheckpointPolicy, CheckpointSettings};

/// Activity since the last checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdSnapshot {
    /// Wall-clock time since the last checkpoint completed.
    pub elapsed: Duration,
    /// Transactions committed since the last checkpoint.
    pub transactions: u64,
    /// Transaction-log bytes appended since the last checkpoint,
    /// across rotations.
    pub bytes: u64,
}

/// Decides whether a checkpoint is due. Pure; holds no state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointThreshold {
    /// Due once this much time passed; zero is due on every evaluation.
    Time(Duration),
    /// Due once this many transactions committed.
    Count(u64),
    /// Due once this many log bytes were written.
    Volume(u64),
    /// Always due.
    Continuous,
    /// Due when any member is due.
    Any(Vec<CheckpointThreshold>),
}

impl CheckpointThreshold {
    /// Builds the threshold selected by `settings.policy`.
    pub fn from_settings(settings: &CheckpointSettings) -> Self {
        match settings.policy {
            CheckpointPolicy::Periodic => CheckpointThreshold::Any(vec![
                CheckpointThreshold::Time(settings.interval_time()),
                CheckpointThreshold::Count(settings.interval_tx),
            ]),
            CheckpointPolicy::Continuous => CheckpointThreshold::Continuous,
            CheckpointPolicy::Volume => CheckpointThreshold::Volume(settings.interval_volume_bytes),
        }
    }

    /// True if any member of the threshold is due.
    pub fn is_checkpoint_needed(&self, snapshot: &ThresholdSnapshot) -> bool {
        self.triggered_by(snapshot).is_some()
    }

    /// The first member that is due, if any.
    pub fn triggered_by(&self, snapshot: &ThresholdSnapshot) -> Option<&CheckpointThreshold> {
        match self {
            CheckpointThreshold::Time(interval) => (snapshot.elapsed >= *interval).then_some(self),
            CheckpointThreshold::Count(count) => {
                (snapshot.transactions >= (*count).max(1)).then_some(self)
            }
            CheckpointThreshold::Volume(bytes) => (snapshot.bytes >= *bytes).then_some(self),
            CheckpointThreshold::Continuous => Some(self),
            CheckpointThreshold::Any(members) => members
                .iter()
                .find_map(|member| member.triggered_by(snapshot)),
        }
    }
}

impl fmt::Display for CheckpointThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointThreshold::Time(interval) => {
                write!(f, "time threshold of {}ms", interval.as_millis())
            }
            CheckpointThreshold::Count(count) => write!(f, "count threshold of {count} transactions"),
            CheckpointThreshold::Volume(bytes) => write!(f, "volume threshold of {bytes} bytes"),
            CheckpointThreshold::Continuous => f.write_str("continuous threshold"),
            CheckpointThreshold::Any(members) => {
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{member}")?;
                }
                Ok(())
            }
        }
    }
}
