#![allow(missing_docs)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use sombra_txlog::checkpoint::{
    CheckPointer, CheckpointLogFile, CheckpointScheduler, CounterMetrics, StorageEngine,
    TriggerInfo, SHUTDOWN_WARNING,
};
use sombra_txlog::config::{CheckpointLogSettings, CheckpointSettings};
use sombra_txlog::types::{KernelVersion, LogPosition, Result, SombraError, TransactionId};
use tempfile::tempdir;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_txlog::checkpoint=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn occurrences(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct IdleEngine;

impl StorageEngine for IdleEngine {
    fn flush_and_force(&self) -> Result<()> {
        Ok(())
    }

    fn current_durable_transaction_id(&self) -> TransactionId {
        TransactionId::base()
    }

    fn current_log_position(&self) -> LogPosition {
        LogPosition::new(0, 64)
    }

    fn current_append_index(&self) -> i64 {
        1
    }

    fn kernel_version(&self) -> KernelVersion {
        KernelVersion::LATEST
    }
}

fn checkpointer(
    dir: &std::path::Path,
    settings: CheckpointSettings,
) -> Result<(Arc<CheckPointer>, Arc<CounterMetrics>)> {
    let metrics = Arc::new(CounterMetrics::default());
    let log = CheckpointLogFile::open(dir, CheckpointLogSettings::default())?;
    let checkpointer = CheckPointer::new(Arc::new(IdleEngine), log, settings)?
        .with_metrics(metrics.clone());
    Ok((Arc::new(checkpointer), metrics))
}

#[test]
fn requests_after_shutdown_warn_or_fail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (checkpointer, metrics) = checkpointer(dir.path(), CheckpointSettings::default())?;
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    tracing::subscriber::with_default(subscriber, || -> Result<()> {
        checkpointer.shutdown()?;
        assert!(checkpointer.is_shut_down());
        assert_eq!(logs.occurrences(SHUTDOWN_WARNING), 0);

        let trigger = TriggerInfo::forced("late");
        assert_eq!(checkpointer.try_check_point_no_wait(&trigger)?, None);
        assert_eq!(logs.occurrences(SHUTDOWN_WARNING), 1);

        assert!(matches!(
            checkpointer.force_check_point(&trigger),
            Err(SombraError::ShutDown)
        ));
        assert_eq!(logs.occurrences(SHUTDOWN_WARNING), 1);

        assert_eq!(checkpointer.check_point_if_needed(&TriggerInfo::scheduled())?, None);
        assert_eq!(logs.occurrences(SHUTDOWN_WARNING), 2);

        checkpointer.shutdown()?;
        Ok(())
    })?;

    assert_eq!(metrics.skipped_shut_down.load(Ordering::Relaxed), 2);
    let records = checkpointer.checkpoint_log().reachable_checkpoints()?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, "Database shutdown");
    Ok(())
}

#[test]
fn shutdown_without_final_checkpoint_writes_nothing() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (checkpointer, _) = checkpointer(
        dir.path(),
        CheckpointSettings {
            checkpoint_on_shutdown: false,
            ..CheckpointSettings::default()
        },
    )?;
    checkpointer.shutdown()?;
    assert!(checkpointer.latest_check_point_info().is_none());
    assert!(checkpointer.checkpoint_log().find_latest_checkpoint()?.is_none());
    Ok(())
}

fn outcome_is_acceptable<T>(result: &Result<T>) -> bool {
    matches!(result, Ok(_) | Err(SombraError::ShutDown))
}

#[test]
fn racing_requests_never_outlive_shutdown() -> Result<()> {
    init_tracing();
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let dir = tempdir().expect("tmpdir");
        let (checkpointer, _) = checkpointer(
            dir.path(),
            CheckpointSettings {
                interval_time_ms: 0,
                ..CheckpointSettings::default()
            },
        )?;
        let scheduler = CheckpointScheduler::start(checkpointer.clone(), Duration::from_millis(1))?;
        let stop = Arc::new(AtomicBool::new(false));
        let shutdown_after = Duration::from_micros(rng.gen_range(0..5_000));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let checkpointer = checkpointer.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    while !stop.load(Ordering::SeqCst) {
                        let trigger = TriggerInfo::forced(format!("worker {worker}"));
                        let ok = if worker % 2 == 0 {
                            outcome_is_acceptable(&checkpointer.force_check_point(&trigger))
                        } else {
                            outcome_is_acceptable(&checkpointer.try_check_point_no_wait(&trigger))
                        };
                        assert!(ok, "unexpected checkpoint failure");
                        thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
                    }
                })
            })
            .collect();

        thread::sleep(shutdown_after);
        checkpointer.shutdown()?;
        thread::sleep(Duration::from_millis(2));
        stop.store(true, Ordering::SeqCst);
        for worker in workers {
            worker.join().expect("worker");
        }
        scheduler.stop();

        let latest = checkpointer
            .checkpoint_log()
            .find_latest_checkpoint()?
            .expect("shutdown checkpoint");
        assert_eq!(latest.reason, "Database shutdown");
        let info = checkpointer.latest_check_point_info().expect("info");
        assert_eq!(info.reason, "Database shutdown");
        assert_eq!(info.checkpoint_count, checkpointer.checkpoint_count());
    }
    Ok(())
}
