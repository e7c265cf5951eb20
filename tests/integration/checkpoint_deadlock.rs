#![allow(missing_docs)]

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sombra_txlog::checkpoint::{CheckPointer, CheckpointLogFile, StorageEngine, TriggerInfo};
use sombra_txlog::config::{CheckpointLogSettings, CheckpointSettings};
use sombra_txlog::primitives::concurrency::CommitBarrier;
use sombra_txlog::types::{KernelVersion, LogPosition, Result, TransactionId};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Engine whose flush needs exclusive access to a resource that
/// committing threads hold shared.
struct LockingEngine {
    resource: Arc<RwLock<()>>,
    barrier: Arc<CommitBarrier>,
    flush_started: Mutex<Option<Sender<()>>>,
    last: Mutex<TransactionId>,
}

impl LockingEngine {
    fn commit(&self) {
        let _permit = self.barrier.commit();
        let mut last = self.last.lock();
        last.id += 1;
    }
}

impl StorageEngine for LockingEngine {
    fn flush_and_force(&self) -> Result<()> {
        if let Some(started) = self.flush_started.lock().take() {
            let _ = started.send(());
        }
        let _exclusive = self.resource.write();
        Ok(())
    }

    fn current_durable_transaction_id(&self) -> TransactionId {
        *self.last.lock()
    }

    fn current_log_position(&self) -> LogPosition {
        LogPosition::new(0, 64)
    }

    fn current_append_index(&self) -> i64 {
        self.last.lock().id
    }

    fn kernel_version(&self) -> KernelVersion {
        KernelVersion::LATEST
    }
}

#[derive(Debug)]
enum Done {
    Commit,
    Checkpoint,
    Population,
}

fn expect_done(done: &Receiver<Done>, count: usize) -> Vec<Done> {
    (0..count)
        .map(|_| match done.recv_timeout(TIMEOUT) {
            Ok(which) => which,
            Err(err) => panic!("threads did not finish, likely deadlocked: {err}"),
        })
        .collect()
}

fn run_once() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (started_tx, started_rx) = mpsc::channel();
    let barrier = Arc::new(CommitBarrier::new());
    let engine = Arc::new(LockingEngine {
        resource: Arc::new(RwLock::new(())),
        barrier: barrier.clone(),
        flush_started: Mutex::new(Some(started_tx)),
        last: Mutex::new(TransactionId::base()),
    });
    let log = CheckpointLogFile::open(dir.path(), CheckpointLogSettings::default())?;
    let checkpointer = Arc::new(
        CheckPointer::new(engine.clone(), log, CheckpointSettings::default())?
            .with_commit_barrier(barrier),
    );
    let (done_tx, done_rx) = mpsc::channel();
    let (holding_tx, holding_rx) = mpsc::channel();
    // Fan the flush-started signal out to the commit and population threads.
    let (commit_go_tx, commit_go_rx) = mpsc::channel::<()>();
    let (population_go_tx, population_go_rx) = mpsc::channel::<()>();

    let committer = {
        let engine = engine.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            let held = engine.resource.read();
            holding_tx.send(()).expect("holding");
            commit_go_rx.recv_timeout(TIMEOUT).expect("flush started");
            engine.commit();
            drop(held);
            done.send(Done::Commit).expect("done");
        })
    };
    holding_rx.recv_timeout(TIMEOUT).expect("commit holds resource");

    let checkpoint = {
        let checkpointer = checkpointer.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            checkpointer
                .force_check_point(&TriggerInfo::forced("deadlock probe"))
                .expect("checkpoint");
            done.send(Done::Checkpoint).expect("done");
        })
    };

    let population = {
        let engine = engine.clone();
        let done = done_tx.clone();
        thread::spawn(move || {
            population_go_rx.recv_timeout(TIMEOUT).expect("flush started");
            drop(engine.resource.read());
            done.send(Done::Population).expect("done");
        })
    };

    started_rx.recv_timeout(TIMEOUT).expect("flush started");
    commit_go_tx.send(()).expect("go");
    population_go_tx.send(()).expect("go");

    let finished = expect_done(&done_rx, 3);
    assert!(finished.iter().any(|d| matches!(d, Done::Commit)));
    assert!(finished.iter().any(|d| matches!(d, Done::Checkpoint)));
    assert!(finished.iter().any(|d| matches!(d, Done::Population)));
    for handle in [committer, checkpoint, population] {
        handle.join().expect("join");
    }
    assert_eq!(checkpointer.checkpoint_count(), 1);
    Ok(())
}

#[test]
fn commit_holding_flush_resource_does_not_deadlock_checkpoint() -> Result<()> {
    for _ in 0..5 {
        run_once()?;
    }
    Ok(())
}

#[test]
fn commits_proceed_while_checkpoint_flushes() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (started_tx, started_rx) = mpsc::channel();
    let barrier = Arc::new(CommitBarrier::new());
    let engine = Arc::new(LockingEngine {
        resource: Arc::new(RwLock::new(())),
        barrier: barrier.clone(),
        flush_started: Mutex::new(Some(started_tx)),
        last: Mutex::new(TransactionId::base()),
    });
    let log = CheckpointLogFile::open(dir.path(), CheckpointLogSettings::default())?;
    let checkpointer = Arc::new(
        CheckPointer::new(engine.clone(), log, CheckpointSettings::default())?
            .with_commit_barrier(barrier),
    );

    // Hold the resource so the flush stays blocked.
    let blocker = engine.resource.read();
    let checkpoint = {
        let checkpointer = checkpointer.clone();
        thread::spawn(move || checkpointer.force_check_point(&TriggerInfo::forced("slow")))
    };
    started_rx.recv_timeout(TIMEOUT).expect("flush started");

    let (done_tx, done_rx) = mpsc::channel();
    let committer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..100 {
                engine.commit();
            }
            done_tx.send(Done::Commit).expect("done");
        })
    };
    expect_done(&done_rx, 1);
    committer.join().expect("committer");
    assert_eq!(engine.current_durable_transaction_id().id, 101);

    drop(blocker);
    checkpoint.join().expect("checkpoint")?;
    let info = checkpointer.latest_check_point_info().expect("info");
    assert_eq!(info.highest_observed_closed_transaction.id, 1);
    Ok(())
}
