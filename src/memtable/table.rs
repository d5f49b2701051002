//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{FlushError, Result};
use crate::flush::FlushJobInfo;
use crate::types::{Entry, InternalKey, RangeTombstone, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};
use crate::version::VersionEdit;

/// Bookkeeping bytes charged per entry on top of key and value
pub const ENTRY_OVERHEAD: usize = 32;

/// In-memory sorted write buffer
pub struct MemTable {
    /// Age-ordered id (smaller is older)
    id: u64,

    /// Point entries: (user_key asc, seq desc) → value
    table: RwLock<BTreeMap<InternalKey, Bytes>>,

    /// Range deletions, in insertion order
    range_dels: RwLock<Vec<RangeTombstone>>,

    memory_usage: AtomicUsize,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    data_size: AtomicU64,

    /// Sequence of the first entry actually inserted
    first_seqno: AtomicU64,
    /// Lower bound for any sequence this memtable may contain
    earliest_seqno: AtomicU64,

    /// Next write-ahead-log number when this memtable was sealed
    next_log_number: AtomicU64,

    /// Unix seconds of the first insert
    oldest_key_time: AtomicU64,

    /// Capacity this memtable was created with
    write_buffer_size: usize,

    /// Pre-allocated manifest edit used by the flush that persists this
    /// memtable (only the oldest memtable of a job carries content)
    edit: Mutex<VersionEdit>,

    /// Info of the flush job that persisted this memtable
    flush_job_info: Mutex<Option<FlushJobInfo>>,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new(id: u64, earliest_seqno: SequenceNumber, write_buffer_size: usize) -> Self {
        Self {
            id,
            table: RwLock::new(BTreeMap::new()),
            range_dels: RwLock::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            first_seqno: AtomicU64::new(MAX_SEQUENCE_NUMBER),
            earliest_seqno: AtomicU64::new(earliest_seqno),
            next_log_number: AtomicU64::new(0),
            oldest_key_time: AtomicU64::new(u64::MAX),
            write_buffer_size,
            edit: Mutex::new(VersionEdit::new()),
            flush_job_info: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a point entry (write lock)
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let key = InternalKey::new(key, sequence, value_type);
        let value = value.into();
        let encoded_len = key.user_key.len() + value.len();

        {
            let mut table = self.table.write();
            if table.contains_key(&key) {
                return Err(FlushError::InvalidArgument(format!(
                    "duplicate entry at sequence {}",
                    sequence
                )));
            }
            table.insert(key, value);
        }

        self.memory_usage
            .fetch_add(encoded_len + ENTRY_OVERHEAD, Ordering::Relaxed);
        self.data_size.fetch_add(encoded_len as u64, Ordering::Relaxed);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        if value_type == ValueType::Deletion {
            self.num_deletes.fetch_add(1, Ordering::Relaxed);
        }
        self.note_sequence(sequence);
        Ok(())
    }

    /// Insert a range deletion covering `[start, end)`
    pub fn delete_range(
        &self,
        sequence: SequenceNumber,
        start: impl Into<Bytes>,
        end: impl Into<Bytes>,
    ) -> Result<()> {
        let tombstone = RangeTombstone::new(start, end, sequence);
        if tombstone.start >= tombstone.end {
            return Err(FlushError::InvalidArgument(
                "range tombstone start must be before end".to_string(),
            ));
        }
        let encoded_len = tombstone.start.len() + tombstone.end.len();

        self.range_dels.write().push(tombstone);

        self.memory_usage
            .fetch_add(encoded_len + ENTRY_OVERHEAD, Ordering::Relaxed);
        self.data_size.fetch_add(encoded_len as u64, Ordering::Relaxed);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        self.num_deletes.fetch_add(1, Ordering::Relaxed);
        self.note_sequence(sequence);
        Ok(())
    }

    fn note_sequence(&self, sequence: SequenceNumber) {
        self.first_seqno.fetch_min(sequence, Ordering::Relaxed);
        self.earliest_seqno.fetch_min(sequence, Ordering::Relaxed);

        if self.oldest_key_time.load(Ordering::Relaxed) == u64::MAX {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = self.oldest_key_time.compare_exchange(
                u64::MAX,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    /// Ordered snapshot of all point entries (newest version first per key)
    pub fn entries(&self) -> Vec<Entry> {
        self.table
            .read()
            .iter()
            .map(|(k, v)| Entry::new(k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of all range tombstones
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_dels.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries.load(Ordering::Relaxed) == 0
    }

    /// Approximate bytes held (keys, values and per-entry overhead)
    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Point entries plus range tombstones
    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    /// Point deletions plus range tombstones
    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    /// Raw key and value bytes
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn first_sequence(&self) -> SequenceNumber {
        self.first_seqno.load(Ordering::Relaxed)
    }

    pub fn earliest_sequence(&self) -> SequenceNumber {
        self.earliest_seqno.load(Ordering::Relaxed)
    }

    pub fn next_log_number(&self) -> u64 {
        self.next_log_number.load(Ordering::Relaxed)
    }

    pub fn set_next_log_number(&self, num: u64) {
        self.next_log_number.store(num, Ordering::Relaxed);
    }

    /// Unix seconds of the first insert, `u64::MAX` if empty
    pub fn oldest_key_time(&self) -> u64 {
        self.oldest_key_time.load(Ordering::Relaxed)
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    /// True once the buffer reached its capacity
    pub fn should_flush_now(&self) -> bool {
        self.approximate_memory_usage() >= self.write_buffer_size
    }

    /// The pre-allocated manifest edit slot
    pub fn edit(&self) -> MutexGuard<'_, VersionEdit> {
        self.edit.lock()
    }

    pub fn set_flush_job_info(&self, info: FlushJobInfo) {
        *self.flush_job_info.lock() = Some(info);
    }

    pub fn take_flush_job_info(&self) -> Option<FlushJobInfo> {
        self.flush_job_info.lock().take()
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("num_entries", &self.num_entries())
            .field("memory_usage", &self.approximate_memory_usage())
            .finish()
    }
}
