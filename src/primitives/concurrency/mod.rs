#![forbid(unsafe_code)]

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use tracing::debug;

use crate::types::{clone_error, Result, SombraError};

/// Non-reentrant section allowing at most one checkpoint in flight.
///
/// `acquire` blocks, `try_acquire` never does. Once shut down, no new
/// holder is admitted and blocked waiters are released with
/// [`SombraError::ShutDown`].
#[derive(Default)]
pub struct CheckpointMutex {
    state: Mutex<SectionState>,
    released: Condvar,
}

#[derive(Default, Debug)]
struct SectionState {
    owner: Option<ThreadId>,
    shut_down: bool,
}

/// Guard for a held checkpoint section; releases on drop.
pub struct CheckpointSection<'a> {
    mutex: &'a CheckpointMutex,
}

impl CheckpointMutex {
    /// Creates an open, unheld section.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the section is free and takes it.
    pub fn acquire(&self) -> Result<CheckpointSection<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            return Err(SombraError::Invalid("checkpoint section is not reentrant"));
        }
        while state.owner.is_some() && !state.shut_down {
            self.released.wait(&mut state);
        }
        if state.shut_down {
            return Err(SombraError::ShutDown);
        }
        state.owner = Some(me);
        Ok(CheckpointSection { mutex: self })
    }

    /// Takes the section if nobody holds it; returns `None` otherwise.
    pub fn try_acquire(&self) -> Result<Option<CheckpointSection<'_>>> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(SombraError::ShutDown);
        }
        if state.owner.is_some() {
            return Ok(None);
        }
        state.owner = Some(thread::current().id());
        Ok(Some(CheckpointSection { mutex: self }))
    }

    /// Returns true while some thread holds the section.
    pub fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Returns true once the section stopped admitting holders.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Stops admitting holders and wakes every blocked `acquire`.
    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        drop(state);
        self.released.notify_all();
    }
}

impl CheckpointSection<'_> {
    /// Shuts the section down, then releases it.
    pub fn close(self) {
        self.mutex.state.lock().shut_down = true;
    }
}

impl Drop for CheckpointSection<'_> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock();
        state.owner = None;
        drop(state);
        self.mutex.released.notify_all();
    }
}

/// Coalesces concurrent force requests so that one flush serves every
/// caller that arrived before it started.
#[derive(Default)]
pub struct ForceBatcher {
    state: Mutex<ForceState>,
    done: Condvar,
}

#[derive(Default)]
struct ForceState {
    requested: u64,
    completed: u64,
    in_flight: bool,
    failure: Option<(u64, SombraError)>,
}

impl ForceBatcher {
    /// Creates an idle batcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a flush started after this call has completed.
    ///
    /// Returns `Ok(true)` when the calling thread ran `flush` itself and
    /// `Ok(false)` when a flush started by another caller covered it.
    pub fn force_with<F>(&self, flush: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut flush = Some(flush);
        let mut state = self.state.lock();
        state.requested += 1;
        let ticket = state.requested;
        loop {
            if let Some((failed_through, err)) = &state.failure {
                if *failed_through >= ticket {
                    return Err(clone_error(err));
                }
            }
            if state.completed >= ticket {
                debug!(ticket, completed = state.completed, "force.coalesced");
                return Ok(false);
            }
            if !state.in_flight {
                break;
            }
            self.done.wait(&mut state);
        }
        state.in_flight = true;
        let target = state.requested;
        drop(state);

        let outcome = match flush.take() {
            Some(flush) => flush(),
            None => Err(SombraError::Invalid("force closure already consumed")),
        };

        let mut state = self.state.lock();
        state.in_flight = false;
        let result = match outcome {
            Ok(()) => {
                state.completed = state.completed.max(target);
                Ok(true)
            }
            Err(err) => {
                state.failure = Some((target, clone_error(&err)));
                Err(err)
            }
        };
        drop(state);
        self.done.notify_all();
        result
    }

    /// Number of force requests seen so far.
    pub fn requested(&self) -> u64 {
        self.state.lock().requested
    }
}

/// Reader/writer barrier between commits and checkpoint snapshots.
///
/// Commits hold the shared side for the duration of a commit; a checkpoint
/// holds the exclusive side only while reading its snapshot, never across
/// the storage flush.
#[derive(Default)]
pub struct CommitBarrier {
    lock: RwLock<()>,
}

/// Shared permit held by a committing thread.
pub struct CommitPermit<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl CommitBarrier {
    /// Creates an unheld barrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the commit side.
    pub fn commit(&self) -> CommitPermit<'_> {
        CommitPermit {
            _guard: self.lock.read(),
        }
    }

    /// Runs `f` while no commit is in progress.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.write();
        f()
    }
}
