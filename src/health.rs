//! Health flag that stops log writes after an unrecoverable failure.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::{Result, SombraError};

/// Whether the logs still accept writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Writes are accepted.
    Healthy,
    /// A failed force stopped all writes.
    Panicked,
}

/// Tracks whether the logs can still be written.
///
/// A failed force leaves the on-disk state unknown, so the first failure
/// panics the database and every later write fails fast.
#[derive(Default)]
pub struct DatabaseHealth {
    cause: RwLock<Option<String>>,
}

impl DatabaseHealth {
    /// Creates a healthy flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the first failure; later calls keep the original cause.
    pub fn panic(&self, cause: &SombraError) {
        let mut slot = self.cause.write();
        if slot.is_none() {
            error!(cause = %cause, "health.panic");
            *slot = Some(cause.to_string());
        }
    }

    /// Current status.
    pub fn status(&self) -> HealthStatus {
        if self.cause.read().is_some() {
            HealthStatus::Panicked
        } else {
            HealthStatus::Healthy
        }
    }

    /// Shorthand for a [`HealthStatus::Healthy`] status.
    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Fails with [`SombraError::Panicked`] once the database panicked.
    pub fn assert_healthy(&self) -> Result<()> {
        match self.cause.read().as_ref() {
            None => Ok(()),
            Some(cause) => Err(SombraError::Panicked(cause.clone())),
        }
    }
}
