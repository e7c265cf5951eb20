#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;
use sombra_txlog::checkpoint::{
    CheckpointLogFile, CheckpointRecord, CounterMetrics, CHECKPOINT_ENVELOPE_MAX_LEN,
    CHECKPOINT_FORMAT_V1, CHECKPOINT_FORMAT_V2,
};
use sombra_txlog::config::CheckpointLogSettings;
use sombra_txlog::log::LogDependencies;
use sombra_txlog::primitives::native::NoopNativeAccess;
use sombra_txlog::types::{
    KernelVersion, LogPosition, Result, TransactionId, BASE_APPEND_INDEX,
    UNKNOWN_CONSENSUS_INDEX,
};
use tempfile::tempdir;

fn record(id: i64) -> CheckpointRecord {
    CheckpointRecord::new(
        TransactionId::new(id, id as u64 * 31, KernelVersion::LATEST, 1_000 + id, 7),
        id + 100,
        KernelVersion::LATEST,
        LogPosition::new(0, 64 + id as u64 * 10),
        format!("checkpoint #{id}"),
    )
}

fn settings(rotation_threshold_bytes: u64, keep_files: usize) -> CheckpointLogSettings {
    CheckpointLogSettings {
        rotation_threshold_bytes,
        keep_files,
        ..CheckpointLogSettings::default()
    }
}

fn open(dir: &std::path::Path, settings: CheckpointLogSettings) -> Result<CheckpointLogFile> {
    CheckpointLogFile::open_with(
        dir,
        settings,
        LogDependencies::default().with_native(Arc::new(NoopNativeAccess)),
    )
}

#[test]
fn brand_new_store_has_no_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let log = open(dir.path(), settings(1024, 3))?;
    assert!(log.find_latest_checkpoint()?.is_none());
    log.rotate()?;
    log.rotate()?;
    assert_eq!(log.matched_files()?.len(), 3);
    assert!(log.find_latest_checkpoint()?.is_none());
    Ok(())
}

#[test]
fn latest_is_found_in_older_file_when_newest_is_empty() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let log = open(dir.path(), settings(1024, 3))?;
    log.append(&record(1))?;
    let second = log.append(&record(2))?;
    log.rotate()?;
    let latest = log.find_latest_checkpoint()?.expect("latest");
    assert_eq!(latest.transaction_id.id, 2);
    assert_eq!(latest.checkpoint_log_position, second);
    assert_eq!(latest.reason, "checkpoint #2");
    Ok(())
}

#[test]
fn torn_trailing_record_is_ignored() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let log = open(dir.path(), settings(4096, 3))?;
    log.append(&record(1))?;
    log.append(&record(2))?;
    let path = dir.path().join("checkpoint.0");
    let len = std::fs::metadata(&path).expect("metadata").len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open")
        .set_len(len - 5)
        .expect("truncate");
    let latest = log.find_latest_checkpoint()?.expect("latest");
    assert_eq!(latest.transaction_id.id, 1);
    Ok(())
}

#[test]
fn legacy_records_read_with_default_fields() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let log = open(dir.path(), settings(4096, 3))?;
    log.append(&record(1))?;
    log.append_with_format(&record(2), CHECKPOINT_FORMAT_V2)?;
    let v1_position = log.append_with_format(&record(3), CHECKPOINT_FORMAT_V1)?;

    let latest = log.find_latest_checkpoint()?.expect("latest");
    assert_eq!(latest.checkpoint_log_position, v1_position);
    assert_eq!(latest.transaction_id.id, 3);
    assert_eq!(latest.append_index, BASE_APPEND_INDEX);
    assert_eq!(latest.transaction_id.consensus_index, UNKNOWN_CONSENSUS_INDEX);
    assert_eq!(latest.kernel_version, KernelVersion::OLDEST);

    let all = log.reachable_checkpoints()?;
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].append_index, 101);
    assert_eq!(all[1].append_index, BASE_APPEND_INDEX);
    assert_eq!(all[1].transaction_id.consensus_index, 7);
    Ok(())
}

#[test]
fn reopened_store_continues_the_checksum_chain() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let log = open(dir.path(), settings(4096, 3))?;
        log.append(&record(1))?;
    }
    let log = open(dir.path(), settings(4096, 3))?;
    log.append(&record(2))?;
    let ids: Vec<i64> = log
        .reachable_checkpoints()?
        .iter()
        .map(|r| r.transaction_id.id)
        .collect();
    assert_eq!(ids, vec![1, 2]);
    Ok(())
}

#[test]
fn open_rewrites_header_of_empty_file_left_by_rotation() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let log = open(dir.path(), settings(4096, 3))?;
        log.append(&record(1))?;
    }
    std::fs::write(dir.path().join("checkpoint.1"), b"")?;

    {
        let log = open(dir.path(), settings(4096, 3))?;
        assert_eq!(log.current_position(), LogPosition::new(1, 64));
        let latest = log.find_latest_checkpoint()?.expect("checkpoint");
        assert_eq!(latest.transaction_id.id, 1);
        let second = log.append(&record(2))?;
        assert_eq!(second, LogPosition::new(1, 64));
    }

    let log = open(dir.path(), settings(4096, 3))?;
    let ids: Vec<i64> = log
        .reachable_checkpoints()?
        .iter()
        .map(|r| r.transaction_id.id)
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(log.find_latest_checkpoint()?.expect("checkpoint").transaction_id.id, 2);
    Ok(())
}

#[test]
fn prune_keeps_most_recent_files() -> Result<()> {
    for keep in 1..=4usize {
        let dir = tempdir().expect("tmpdir");
        let metrics = Arc::new(CounterMetrics::default());
        let log = CheckpointLogFile::open_with(
            dir.path(),
            settings(1024, keep),
            LogDependencies::default()
                .with_native(Arc::new(NoopNativeAccess))
                .with_metrics(metrics.clone()),
        )?;
        let mut total_files = 1;
        for id in 1..=30 {
            let before = log.current_version();
            let position = log.append(&record(id))?;
            if position.log_version != before {
                total_files += 1;
            }
            log.prune(position)?;
            let versions: Vec<u64> = log.matched_files()?.into_iter().map(|(v, _)| v).collect();
            let expected = keep.min(total_files);
            assert_eq!(versions.len(), expected, "keep={keep} after record {id}");
            let newest = log.current_version();
            let want: Vec<u64> = (newest + 1 - expected as u64..=newest).collect();
            assert_eq!(versions, want);
        }
        assert!(total_files > 4);
        assert_eq!(
            metrics.checkpoint_log_rotations.load(Ordering::Relaxed),
            total_files as u64 - 1
        );
        assert_eq!(
            metrics.checkpoint_log_pruned_files.load(Ordering::Relaxed),
            (total_files - keep) as u64
        );
        assert!(log.find_latest_checkpoint()?.is_some());
    }
    Ok(())
}

#[test]
fn prune_never_removes_files_holding_the_latest_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let log = open(dir.path(), settings(1024, 1))?;
    let kept = log.append(&record(1))?;
    log.rotate()?;
    log.rotate()?;
    assert!(log.prune(kept)?.is_empty());
    assert_eq!(log.matched_files()?.len(), 3);
    assert_eq!(log.prune(log.current_position())?, vec![0, 1]);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn files_never_exceed_rotation_threshold(threshold in 1024u64..4096, records in 1usize..40) {
        let dir = tempdir().expect("tmpdir");
        let log = open(dir.path(), settings(threshold, 1000)).expect("open");
        for id in 0..records {
            log.append(&record(id as i64)).expect("append");
        }
        let current = log.current_version();
        for (version, _) in log.matched_files().expect("files") {
            let logical = log.logical_len(version).expect("len");
            prop_assert!(logical <= threshold);
            prop_assert!(logical < threshold + CHECKPOINT_ENVELOPE_MAX_LEN);
            if version != current {
                prop_assert!(logical > 64, "rotated file {} holds no records", version);
            }
        }
        let ids: Vec<i64> = log
            .reachable_checkpoints()
            .expect("scan")
            .iter()
            .map(|r| r.transaction_id.id)
            .collect();
        prop_assert_eq!(ids, (0..records as i64).collect::<Vec<_>>());
    }
}
