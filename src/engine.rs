//! Engine Module
//!
//! A small write path around the flush job: it owns the active memtable of
//! each column family, seals full buffers and runs flushes.
//!
//! ## Responsibilities
//! - Assign sequence numbers and write into the active memtables
//! - Seal memtables into the immutable list (`switch_memtable`)
//! - Track live snapshots
//! - Run a [`FlushJob`] per flush request and free what it committed
//! - Rebuild versions from the manifest on open

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::column_family::{ColumnFamilyData, DbMutex, DbState};
use crate::compaction::SnapshotSet;
use crate::config::{ColumnFamilyOptions, Config};
use crate::error::{FlushError, Result};
use crate::flush::{FlushJob, FlushJobBuilder, FlushOutcome, FlushReason, LogBuffer};
use crate::memtable::MemTable;
use crate::stats::{EventSink, Statistics, TracingEventSink};
use crate::table::{SstTableBuilder, TableFileBuilder};
use crate::types::{SequenceNumber, ValueType};
use crate::version::{FileMetaData, ManifestLog, VersionSet};

/// Id of the column family every engine starts with
pub const DEFAULT_COLUMN_FAMILY: u32 = 0;

/// The storage engine
///
/// ## Locking
/// - `db` is the shared db mutex handed to flush jobs
/// - `mems` guards the active memtables; writes take only this lock
///
/// When both are needed `db` is always taken first.
pub struct Engine {
    config: Config,

    /// Directory for level-0 table files
    table_dir: PathBuf,

    db: DbMutex,

    /// Active (mutable) memtable per column family
    mems: Mutex<BTreeMap<u32, Arc<MemTable>>>,

    last_sequence: AtomicU64,
    next_memtable_id: AtomicU64,
    next_job_id: AtomicU64,
    /// Number of the write-ahead log new writes would go to
    log_number: AtomicU64,

    /// Live snapshots and their reference counts
    snapshots: Mutex<BTreeMap<SequenceNumber, usize>>,

    shutting_down: Arc<AtomicBool>,
    stats: Arc<Statistics>,
    event_sink: Arc<dyn EventSink>,
    table_builder: Arc<dyn TableFileBuilder>,
    log_buffer: Arc<Mutex<LogBuffer>>,
}

impl Engine {
    const MANIFEST_FILENAME: &'static str = "MANIFEST";
    const TABLE_DIR: &'static str = "tables";

    /// Open or create an engine with only the default column family
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_column_families(config, Vec::new())
    }

    /// Open or create an engine. The default column family gets id 0; the
    /// others get ids 1.. in the given order.
    ///
    /// On startup:
    /// 1. Create the data and table directories
    /// 2. Replay the manifest into per-column-family versions
    /// 3. Open the manifest for appending
    pub fn open_with_column_families(
        config: Config,
        column_families: Vec<ColumnFamilyOptions>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let table_dir = config.data_dir.join(Self::TABLE_DIR);
        fs::create_dir_all(&table_dir)?;

        let manifest_path = config.data_dir.join(Self::MANIFEST_FILENAME);
        let records = if manifest_path.exists() {
            ManifestLog::read_records(&manifest_path)?
        } else {
            Vec::new()
        };
        let manifest = ManifestLog::open(&manifest_path)?;

        let mut state = DbState::new(VersionSet::new(Box::new(manifest)));
        state.add_column_family(ColumnFamilyData::new(
            DEFAULT_COLUMN_FAMILY,
            ColumnFamilyOptions::new("default"),
        ));
        for (i, options) in column_families.into_iter().enumerate() {
            state.add_column_family(ColumnFamilyData::new(i as u32 + 1, options));
        }

        // Replay
        let mut last_sequence = 0;
        let mut max_log_number = 0;
        for record in &records {
            state.versions.recover_next_file_number(record.next_file_number);
            for edit in &record.edits {
                let Some((versions, cfd)) = state.split_mut(edit.column_family()) else {
                    warn!(cf = edit.column_family(), "manifest edit for unknown column family");
                    continue;
                };
                for (_, meta) in edit.new_files() {
                    versions.mark_file_number_used(meta.number());
                    last_sequence = last_sequence.max(meta.fd.largest_seqno);
                }
                let next = cfd.current().apply(edit);
                cfd.install_version(Arc::new(next));
                if let Some(n) = edit.log_number() {
                    cfd.set_log_number(n);
                    max_log_number = max_log_number.max(n);
                }
            }
        }
        if !records.is_empty() {
            info!(
                records = records.len(),
                last_sequence,
                next_file_number = state.versions.peek_next_file_number(),
                "recovered manifest"
            );
        }

        let engine = Self {
            config,
            table_dir,
            db: DbMutex::new(state),
            mems: Mutex::new(BTreeMap::new()),
            last_sequence: AtomicU64::new(last_sequence),
            next_memtable_id: AtomicU64::new(1),
            next_job_id: AtomicU64::new(1),
            log_number: AtomicU64::new(max_log_number.max(1)),
            snapshots: Mutex::new(BTreeMap::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Statistics::new()),
            event_sink: Arc::new(TracingEventSink),
            table_builder: Arc::new(SstTableBuilder::new()),
            log_buffer: Arc::new(Mutex::new(LogBuffer::new())),
        };

        {
            let db = engine.db.lock();
            let mut mems = engine.mems.lock();
            for id in db.column_family_ids() {
                mems.insert(id, engine.new_memtable());
            }
        }

        Ok(engine)
    }

    /// Open with a path (convenience method)
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Route flush events to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Replace the level-0 table builder
    pub fn with_table_builder(mut self, builder: Arc<dyn TableFileBuilder>) -> Self {
        self.table_builder = builder;
        self
    }

    fn new_memtable(&self) -> Arc<MemTable> {
        let id = self.next_memtable_id.fetch_add(1, Ordering::SeqCst);
        let earliest = self.last_sequence.load(Ordering::SeqCst) + 1;
        Arc::new(MemTable::new(id, earliest, self.config.write_buffer_size))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair into column family `cf`
    pub fn put(&self, cf: u32, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        self.write(cf, ValueType::Value, key, value)
    }

    /// Write a point deletion
    pub fn delete(&self, cf: u32, key: &[u8]) -> Result<SequenceNumber> {
        self.write(cf, ValueType::Deletion, key, &[])
    }

    /// Write a merge operand
    pub fn merge(&self, cf: u32, key: &[u8], operand: &[u8]) -> Result<SequenceNumber> {
        self.write(cf, ValueType::Merge, key, operand)
    }

    /// Delete every key in `[start, end)`
    pub fn delete_range(&self, cf: u32, start: &[u8], end: &[u8]) -> Result<SequenceNumber> {
        let (seq, full) = {
            let mems = self.mems.lock();
            let mem = Self::active(&mems, cf)?;
            let seq = self.last_sequence.load(Ordering::SeqCst) + 1;
            mem.delete_range(seq, Bytes::copy_from_slice(start), Bytes::copy_from_slice(end))?;
            self.last_sequence.store(seq, Ordering::SeqCst);
            (seq, mem.should_flush_now())
        };
        if full {
            self.flush_full_buffer(cf);
        }
        Ok(seq)
    }

    fn write(&self, cf: u32, value_type: ValueType, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        // Sequence allocation and insert happen under `mems` so memtable
        // contents stay in sequence order
        let (seq, full) = {
            let mems = self.mems.lock();
            let mem = Self::active(&mems, cf)?;
            let seq = self.last_sequence.load(Ordering::SeqCst) + 1;
            mem.add(
                seq,
                value_type,
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
            )?;
            self.last_sequence.store(seq, Ordering::SeqCst);
            (seq, mem.should_flush_now())
        };
        if full {
            self.flush_full_buffer(cf);
        }
        Ok(seq)
    }

    fn active(mems: &BTreeMap<u32, Arc<MemTable>>, cf: u32) -> Result<&Arc<MemTable>> {
        mems.get(&cf)
            .ok_or_else(|| FlushError::InvalidArgument(format!("column family {} not found", cf)))
    }

    /// The write already succeeded; a failed flush is only logged
    fn flush_full_buffer(&self, cf: u32) {
        match self.flush(cf, FlushReason::WriteBufferFull) {
            Ok(outcome) if !outcome.is_ok() => warn!(
                cf,
                status = ?outcome.status,
                io_status = ?outcome.io_status,
                "buffer-full flush did not succeed"
            ),
            Ok(_) => {}
            Err(e) => warn!(cf, error = %e, "buffer-full flush failed"),
        }
    }

    // =========================================================================
    // Memtable switching
    // =========================================================================

    /// Seal the active memtable of `cf` into the immutable list.
    ///
    /// Returns the sealed memtable's id, or `None` if it was empty.
    pub fn switch_memtable(&self, cf: u32) -> Result<Option<u64>> {
        let mut db = self.db.lock();
        self.switch_memtable_locked(&mut db, cf)
    }

    fn switch_memtable_locked(&self, db: &mut DbState, cf: u32) -> Result<Option<u64>> {
        let cfd = db
            .cf_mut(cf)
            .ok_or_else(|| FlushError::InvalidArgument(format!("column family {} not found", cf)))?;

        let mut mems = self.mems.lock();
        if mems.get(&cf).map_or(true, |m| m.is_empty()) {
            return Ok(None);
        }
        let Some(sealed) = mems.insert(cf, self.new_memtable()) else {
            return Ok(None);
        };

        // A new log is started for writes going to the fresh memtable
        let next_log = self.log_number.fetch_add(1, Ordering::SeqCst) + 1;
        sealed.set_next_log_number(next_log);

        let id = sealed.id();
        cfd.imm_mut().add(sealed, true);
        debug!(cf, memtable = id, next_log, "sealed memtable");
        Ok(Some(id))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Pin the current sequence number
    pub fn snapshot(&self) -> SequenceNumber {
        let seq = self.last_sequence.load(Ordering::SeqCst);
        *self.snapshots.lock().entry(seq).or_insert(0) += 1;
        seq
    }

    pub fn release_snapshot(&self, seq: SequenceNumber) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&seq);
            }
        }
    }

    fn snapshot_set(&self) -> SnapshotSet {
        let seqs = self.snapshots.lock().keys().copied().collect();
        SnapshotSet::new(seqs)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Seal the active memtable of `cf` and flush every sealed memtable
    pub fn flush(&self, cf: u32, reason: FlushReason) -> Result<FlushOutcome> {
        let mut db = self.db.lock();
        self.switch_memtable_locked(&mut db, cf)?;

        let cfd = db
            .cf_mut(cf)
            .ok_or_else(|| FlushError::InvalidArgument(format!("column family {} not found", cf)))?;
        cfd.set_flush_reason(reason);
        let max_memtable_id = cfd.imm().latest_id().unwrap_or(0);

        let mut job = self.new_flush_job(cf, max_memtable_id);
        job.pick_memtable(&mut db);
        let outcome = job.run(&mut db);
        let freed = job.take_memtables_to_free();
        drop(db);

        self.log_buffer.lock().flush_buffer_to_log();
        debug!(
            cf,
            job_id = job.job_id(),
            freed = freed.len(),
            committed = job.committed_flush_jobs().len(),
            "flush returned"
        );
        Ok(outcome)
    }

    /// A flush job for `cf` wired to this engine's shared state
    pub fn new_flush_job(&self, cf: u32, max_memtable_id: u64) -> FlushJob {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        FlushJobBuilder::new(job_id, cf, &self.config)
            .max_memtable_id(max_memtable_id)
            .output_dir(&self.table_dir)
            .snapshots(self.snapshot_set())
            .shutting_down(Arc::clone(&self.shutting_down))
            .table_builder(Arc::clone(&self.table_builder))
            .statistics(Arc::clone(&self.stats))
            .event_sink(Arc::clone(&self.event_sink))
            .log_buffer(Arc::clone(&self.log_buffer))
            .build()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark `cf` dropped. Running flushes of it finish with a dropped status.
    pub fn drop_column_family(&self, cf: u32) -> Result<()> {
        let mut db = self.db.lock();
        let cfd = db
            .cf_mut(cf)
            .ok_or_else(|| FlushError::InvalidArgument(format!("column family {} not found", cf)))?;
        cfd.set_dropped();
        info!(cf, name = %cfd.name(), "column family dropped");
        Ok(())
    }

    /// Make every flush that has not installed yet fail with shutdown
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Flush every live column family, then shut down
    pub fn close(self) -> Result<()> {
        let ids = self.db.lock().column_family_ids();
        let mut first_error = None;
        for cf in ids {
            if self.db.lock().cf(cf).map_or(true, |c| c.is_dropped()) {
                continue;
            }
            let outcome = self.flush(cf, FlushReason::ShutDown)?;
            if let Err(e) = outcome.status {
                first_error.get_or_insert(e);
            } else if let Err(e) = outcome.io_status {
                first_error.get_or_insert(FlushError::Io(e));
            }
        }
        self.begin_shutdown();
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Directory holding level-0 table files
    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    /// The shared db mutex
    pub fn db(&self) -> &DbMutex {
        &self.db
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Entries in the active memtable of `cf`
    pub fn active_entry_count(&self, cf: u32) -> u64 {
        self.mems.lock().get(&cf).map_or(0, |m| m.num_entries())
    }

    /// Sealed memtables of `cf` not yet flushed
    pub fn num_immutable_memtables(&self, cf: u32) -> usize {
        self.db.lock().cf(cf).map_or(0, |c| c.imm().num_not_flushed())
    }

    /// Level-0 files of `cf`, newest first
    pub fn level0_files(&self, cf: u32) -> Vec<FileMetaData> {
        self.db
            .lock()
            .cf(cf)
            .map(|c| c.current().files(0).to_vec())
            .unwrap_or_default()
    }

    /// Logs below this number are no longer needed by `cf`
    pub fn log_number(&self, cf: u32) -> u64 {
        self.db.lock().cf(cf).map_or(0, |c| c.log_number())
    }
}
