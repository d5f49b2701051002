//! Tests for the immutable memtable list
//!
//! These tests verify:
//! - Picking respects the id bound and skips memtables already picked
//! - Rollback returns memtables to pending and clears their edits
//! - Install commits only leading completed memtables, oldest first
//! - A failed manifest write restores the batch
//! - Mempurge installs remove their inputs at once
//! - A rolled back mempurge output leaves the list

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use flushkv::error::IoError;
use flushkv::flush::{FlushJobInfo, FlushReason};
use flushkv::memtable::{FlushState, MemTable, MemTableList};
use flushkv::table::TableProperties;
use flushkv::types::ValueType;
use flushkv::version::{FileMetaData, VersionEdit};

fn mem(id: u64) -> Arc<MemTable> {
    let mem = MemTable::new(id, 0, 1 << 20);
    mem.add(id, ValueType::Value, Bytes::from(format!("key{}", id)), Bytes::from_static(b"v"))
        .unwrap();
    Arc::new(mem)
}

fn list_of(ids: &[u64]) -> (MemTableList, Vec<Arc<MemTable>>) {
    let mut list = MemTableList::new();
    let mems: Vec<_> = ids.iter().map(|&id| mem(id)).collect();
    for m in &mems {
        list.add(Arc::clone(m), true);
    }
    (list, mems)
}

/// What a finished flush job leaves in the oldest memtable's edit
fn record_flush(mems: &[Arc<MemTable>], file_number: u64, log_number: u64) {
    let mut edit = mems[0].edit();
    edit.set_log_number(log_number);
    let mut meta = FileMetaData::default();
    meta.fd.number = file_number;
    meta.fd.file_size = 100;
    edit.add_file(0, meta);
}

fn job_info(job_id: u64, file_number: u64) -> FlushJobInfo {
    FlushJobInfo {
        cf_id: 0,
        cf_name: "default".to_string(),
        file_path: format!("{:06}.sst", file_number).into(),
        file_number,
        oldest_blob_file_number: 0,
        thread_id: "test".to_string(),
        job_id,
        smallest_seqno: 0,
        largest_seqno: 0,
        table_properties: TableProperties::default(),
        flush_reason: FlushReason::ManualFlush,
    }
}

fn ids(mems: &[Arc<MemTable>]) -> Vec<u64> {
    mems.iter().map(|m| m.id()).collect()
}

// =============================================================================
// Pick
// =============================================================================

#[test]
fn test_add_keeps_id_order() {
    let mut list = MemTableList::new();
    list.add(mem(3), true);
    list.add(mem(1), true);
    list.add(mem(2), false);

    assert_eq!(ids(&list.memtables()), vec![1, 2, 3]);
    assert_eq!(list.latest_id(), Some(3));
    assert_eq!(list.num_not_flushed(), 3);
}

#[test]
fn test_pick_respects_max_id() {
    let (mut list, mems) = list_of(&[1, 2, 3]);

    let picked = list.pick_memtables_to_flush(2);

    assert_eq!(ids(&picked), vec![1, 2]);
    assert_eq!(list.state_of(&mems[0]), Some(FlushState::InProgress));
    assert_eq!(list.state_of(&mems[2]), Some(FlushState::Pending));
    assert_eq!(list.num_flush_not_started(), 1);
}

#[test]
fn test_pick_skips_memtables_already_picked() {
    let (mut list, _) = list_of(&[1, 2]);
    let first = list.pick_memtables_to_flush(1);
    list.add(mem(3), true);

    let second = list.pick_memtables_to_flush(u64::MAX);

    assert_eq!(ids(&first), vec![1]);
    assert_eq!(ids(&second), vec![2, 3]);
    assert!(list.starts_with(&first));
    assert!(!list.starts_with(&second));
}

#[test]
fn test_flush_pending_tracks_requests() {
    let (mut list, _) = list_of(&[1]);
    assert!(list.is_flush_pending());

    let picked = list.pick_memtables_to_flush(u64::MAX);
    assert!(!list.is_flush_pending());

    list.rollback_memtable_flush(&picked, 7);
    assert!(list.is_flush_pending());
}

#[test]
fn test_substitution_does_not_request_flush() {
    let mut list = MemTableList::new();
    list.add(mem(1), false);

    assert!(!list.is_flush_pending());
    assert_eq!(list.num_flush_not_started(), 1);
}

// =============================================================================
// Rollback
// =============================================================================

#[test]
fn test_rollback_restores_pending_and_clears_edit() {
    let (mut list, mems) = list_of(&[1, 2]);
    let picked = list.pick_memtables_to_flush(u64::MAX);
    record_flush(&picked, 10, 5);
    assert!(!mems[0].edit().is_empty());

    list.rollback_memtable_flush(&picked, 10);

    assert_eq!(list.state_of(&mems[0]), Some(FlushState::Pending));
    assert_eq!(list.state_of(&mems[1]), Some(FlushState::Pending));
    assert!(mems[0].edit().is_empty());
    assert_eq!(ids(&list.pick_memtables_to_flush(u64::MAX)), vec![1, 2]);
}

// =============================================================================
// Install
// =============================================================================

#[test]
fn test_install_commits_leading_batch() {
    let (mut list, mems) = list_of(&[1, 2, 3]);
    let picked = list.pick_memtables_to_flush(2);
    record_flush(&picked, 10, 3);
    mems[0].set_flush_job_info(job_info(1, 10));

    let mut applied: Vec<Vec<VersionEdit>> = Vec::new();
    let outcome = list.try_install_memtable_flush_results(&picked, 10, true, |edits| {
        applied.push(edits.to_vec());
        Ok(())
    });

    assert!(outcome.io_status.is_ok());
    assert_eq!(ids(&outcome.memtables_to_free), vec![1, 2]);
    assert_eq!(outcome.committed_flush_jobs, vec![job_info(1, 10)]);
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].len(), 1);
    assert_eq!(applied[0][0].log_number(), Some(3));
    assert_eq!(ids(&list.memtables()), vec![3]);
}

#[test]
fn test_newer_job_waits_for_older() {
    let (mut list, mems) = list_of(&[1, 2]);
    let older = list.pick_memtables_to_flush(1);
    let newer = list.pick_memtables_to_flush(2);
    record_flush(&older, 10, 2);
    record_flush(&newer, 11, 3);

    let mut applied: Vec<Vec<VersionEdit>> = Vec::new();
    let outcome = list.try_install_memtable_flush_results(&newer, 11, true, |edits| {
        applied.push(edits.to_vec());
        Ok(())
    });

    assert!(applied.is_empty());
    assert!(outcome.memtables_to_free.is_empty());
    assert_eq!(list.state_of(&mems[1]), Some(FlushState::Completed { file_number: 11 }));

    let outcome = list.try_install_memtable_flush_results(&older, 10, true, |edits| {
        applied.push(edits.to_vec());
        Ok(())
    });

    // Both jobs commit in one manifest record, oldest edit first
    assert_eq!(applied.len(), 1);
    let log_numbers: Vec<_> = applied[0].iter().map(|e| e.log_number()).collect();
    assert_eq!(log_numbers, vec![Some(2), Some(3)]);
    assert_eq!(ids(&outcome.memtables_to_free), vec![1, 2]);
    assert!(list.is_empty());
}

#[test]
fn test_one_edit_per_job_in_batch() {
    let (mut list, _) = list_of(&[1, 2, 3]);
    let picked = list.pick_memtables_to_flush(u64::MAX);
    record_flush(&picked, 10, 4);

    let mut edit_count = 0;
    let outcome = list.try_install_memtable_flush_results(&picked, 10, true, |edits| {
        edit_count += edits.len();
        Ok(())
    });

    assert_eq!(edit_count, 1);
    assert_eq!(outcome.memtables_to_free.len(), 3);
}

#[test]
fn test_manifest_failure_restores_batch() {
    let (mut list, mems) = list_of(&[1, 2]);
    let picked = list.pick_memtables_to_flush(u64::MAX);
    record_flush(&picked, 10, 3);
    mems[0].set_flush_job_info(job_info(1, 10));

    let outcome = list.try_install_memtable_flush_results(&picked, 10, true, |_| {
        Err(IoError::new(io::ErrorKind::Other, "disk full"))
    });

    let err = outcome.io_status.unwrap_err();
    assert_eq!(err.message(), "disk full");
    assert!(outcome.memtables_to_free.is_empty());
    assert!(outcome.committed_flush_jobs.is_empty());
    assert_eq!(list.state_of(&mems[0]), Some(FlushState::Pending));
    assert_eq!(list.state_of(&mems[1]), Some(FlushState::Pending));
    assert!(mems[0].edit().is_empty());
    assert!(list.is_flush_pending());
}

#[test]
fn test_mempurge_install_removes_inputs_at_once() {
    let (mut list, mems) = list_of(&[1, 2, 3]);
    // Job for 1 still running
    let _older = list.pick_memtables_to_flush(1);
    let picked = list.pick_memtables_to_flush(3);

    let mut manifest_writes = 0;
    let outcome = list.try_install_memtable_flush_results(&picked, 11, false, |_| {
        manifest_writes += 1;
        Ok(())
    });

    assert_eq!(manifest_writes, 0);
    assert!(outcome.io_status.is_ok());
    assert_eq!(ids(&outcome.memtables_to_free), vec![2, 3]);
    assert_eq!(ids(&list.memtables()), vec![1]);
    assert_eq!(list.state_of(&mems[0]), Some(FlushState::InProgress));
}

#[test]
fn test_commit_clears_mempurge_tag() {
    let (mut list, mems) = list_of(&[1]);
    list.add_mempurge_output_id(1);
    let picked = list.pick_memtables_to_flush(u64::MAX);
    record_flush(&picked, 10, 2);

    let outcome = list.try_install_memtable_flush_results(&picked, 10, true, |_| Ok(()));

    assert!(outcome.io_status.is_ok());
    assert!(!list.is_mempurge_output(1));
    assert_eq!(list.state_of(&mems[0]), None);
}

#[test]
fn test_remove_mempurge_output() {
    let (mut list, mems) = list_of(&[1, 2]);
    let output = mem(1);
    list.add(Arc::clone(&output), false);
    list.add_mempurge_output_id(1);

    assert!(list.remove_mempurge_output(&output));

    assert_eq!(list.len(), 2);
    assert!(!list.is_mempurge_output(1));
    assert_eq!(list.state_of(&output), None);
    assert_eq!(list.state_of(&mems[0]), Some(FlushState::Pending));
    assert!(!list.remove_mempurge_output(&output));
}
