use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::checkpoint::coordinator::{CheckPointer, TriggerInfo};
use crate::types::{Result, SombraError};

enum SchedulerMessage {
    Tick,
    Shutdown,
}

/// Background thread calling [`CheckPointer::check_point_if_needed`] at a
/// fixed cadence.
pub struct CheckpointScheduler {
    sender: Sender<SchedulerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CheckpointScheduler {
    /// Starts the scheduler thread.
    pub fn start(checkpointer: Arc<CheckPointer>, cadence: Duration) -> Result<Self> {
        if cadence.is_zero() {
            return Err(SombraError::Invalid("scheduler cadence must be positive"));
        }
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("sombra-checkpoint".into())
            .spawn(move || Self::run(checkpointer, receiver, cadence))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Requests an evaluation now instead of at the next tick.
    pub fn trigger(&self) -> Result<()> {
        self.sender
            .send(SchedulerMessage::Tick)
            .map_err(|_| SombraError::ShutDown)
    }

    /// Stops the thread and waits for a running evaluation to finish.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.sender.send(SchedulerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("checkpoint.scheduler.panicked");
            }
        }
    }

    fn run(checkpointer: Arc<CheckPointer>, receiver: Receiver<SchedulerMessage>, cadence: Duration) {
        debug!(cadence_ms = cadence.as_millis() as u64, "checkpoint.scheduler.start");
        loop {
            match receiver.recv_timeout(cadence) {
                Ok(SchedulerMessage::Tick) | Err(RecvTimeoutError::Timeout) => {}
                Ok(SchedulerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if checkpointer.is_shut_down() {
                break;
            }
            if let Err(err) = checkpointer.check_point_if_needed(&TriggerInfo::scheduled()) {
                error!(error = %err, "checkpoint.scheduler.tick_failed");
            }
        }
        debug!("checkpoint.scheduler.stop");
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
