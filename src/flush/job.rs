//! The flush job
//!
//! One job flushes the picked memtables of one column family. See the module
//! docs for the lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::column_family::DbState;
use crate::compaction::{
    GcOptions, MergingIterator, OlderDataCheck, RangeDelAggregator, SnapshotSet,
    TableFileCreationReason,
};
use crate::config::{ColumnFamilyOptions, Config, MempurgePolicy};
use crate::error::{FlushError, IoStatus, Result};
use crate::memtable::MemTable;
use crate::stats::{
    CompactionReason, CompactionStats, EventSink, FlushEvent, FlushJobRecord,
    FlushStartedRecord, Histogram, Statistics, Ticker, TracingEventSink,
};
use crate::table::{
    sync_dir, table_file_path, unix_now, BuildRequest, IoTimings, SstTableBuilder,
    TableFileBuilder, TableProperties,
};
use crate::version::{BlobFileAddition, FileDescriptor, FileMetaData, Version};

use super::{FlushJobInfo, FlushOutcome, FlushReason, LogBuffer};

/// Builds a [`FlushJob`]
pub struct FlushJobBuilder {
    job_id: u64,
    cf_id: u32,
    max_memtable_id: u64,
    output_dir: PathBuf,
    write_buffer_size: usize,
    mempurge_policy: MempurgePolicy,
    flush_verify_memtable_count: bool,
    measure_io_stats: bool,
    sync_output_directory: bool,
    write_manifest: bool,
    snapshots: SnapshotSet,
    shutting_down: Arc<AtomicBool>,
    table_builder: Arc<dyn TableFileBuilder>,
    stats: Arc<Statistics>,
    event_sink: Arc<dyn EventSink>,
    log_buffer: Arc<Mutex<LogBuffer>>,
}

impl FlushJobBuilder {
    pub fn new(job_id: u64, cf_id: u32, config: &Config) -> Self {
        Self {
            job_id,
            cf_id,
            max_memtable_id: u64::MAX,
            output_dir: config.data_dir.join("tables"),
            write_buffer_size: config.write_buffer_size,
            mempurge_policy: config.mempurge_policy,
            flush_verify_memtable_count: config.flush_verify_memtable_count,
            measure_io_stats: config.measure_io_stats,
            sync_output_directory: config.sync_output_directory,
            write_manifest: config.write_manifest,
            snapshots: SnapshotSet::default(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            table_builder: Arc::new(SstTableBuilder::new()),
            stats: Arc::new(Statistics::new()),
            event_sink: Arc::new(TracingEventSink),
            log_buffer: Arc::new(Mutex::new(LogBuffer::new())),
        }
    }

    /// Only memtables with an id up to `id` are picked
    pub fn max_memtable_id(mut self, id: u64) -> Self {
        self.max_memtable_id = id;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn snapshots(mut self, snapshots: SnapshotSet) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn shutting_down(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutting_down = flag;
        self
    }

    pub fn table_builder(mut self, builder: Arc<dyn TableFileBuilder>) -> Self {
        self.table_builder = builder;
        self
    }

    pub fn statistics(mut self, stats: Arc<Statistics>) -> Self {
        self.stats = stats;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn log_buffer(mut self, log_buffer: Arc<Mutex<LogBuffer>>) -> Self {
        self.log_buffer = log_buffer;
        self
    }

    pub fn write_manifest(mut self, write_manifest: bool) -> Self {
        self.write_manifest = write_manifest;
        self
    }

    pub fn build(self) -> FlushJob {
        FlushJob {
            job_id: self.job_id,
            cf_id: self.cf_id,
            cf_name: String::new(),
            cf_options: None,
            max_memtable_id: self.max_memtable_id,
            output_dir: self.output_dir,
            write_buffer_size: self.write_buffer_size,
            mempurge_policy: self.mempurge_policy,
            flush_verify_memtable_count: self.flush_verify_memtable_count,
            measure_io_stats: self.measure_io_stats,
            sync_output_directory: self.sync_output_directory,
            write_manifest: self.write_manifest,
            snapshots: self.snapshots,
            shutting_down: self.shutting_down,
            table_builder: self.table_builder,
            flush_reason: FlushReason::Others,
            stats: self.stats,
            event_sink: self.event_sink,
            log_buffer: self.log_buffer,
            pick_memtable_called: false,
            mems: Vec::new(),
            meta: FileMetaData::default(),
            base: None,
            mempurge_input_ids: Vec::new(),
            inputs_include_oldest: false,
            table_properties: TableProperties::default(),
            io_status: Ok(()),
            io_timings: None,
            mempurge_output: None,
            memtables_to_free: Vec::new(),
            committed_flush_jobs: Vec::new(),
        }
    }
}

/// Flushes the sealed memtables of one column family
pub struct FlushJob {
    job_id: u64,
    cf_id: u32,
    cf_name: String,
    cf_options: Option<Arc<ColumnFamilyOptions>>,
    max_memtable_id: u64,
    output_dir: PathBuf,
    write_buffer_size: usize,
    mempurge_policy: MempurgePolicy,
    flush_verify_memtable_count: bool,
    measure_io_stats: bool,
    sync_output_directory: bool,
    write_manifest: bool,
    snapshots: SnapshotSet,
    shutting_down: Arc<AtomicBool>,
    table_builder: Arc<dyn TableFileBuilder>,
    flush_reason: FlushReason,
    pub(super) stats: Arc<Statistics>,
    event_sink: Arc<dyn EventSink>,
    log_buffer: Arc<Mutex<LogBuffer>>,

    pick_memtable_called: bool,
    /// Picked memtables, oldest first
    pub(super) mems: Vec<Arc<MemTable>>,
    meta: FileMetaData,
    /// Version pinned at pick time; `None` once released
    base: Option<Arc<Version>>,
    /// Ids of picked memtables that are themselves mempurge outputs
    mempurge_input_ids: Vec<u64>,
    /// The picked memtables are the oldest unflushed data of the column family
    inputs_include_oldest: bool,
    table_properties: TableProperties,
    io_status: IoStatus,
    io_timings: Option<IoTimings>,
    pub(super) mempurge_output: Option<Arc<MemTable>>,
    memtables_to_free: Vec<Arc<MemTable>>,
    committed_flush_jobs: Vec<FlushJobInfo>,
}

impl FlushJob {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn column_family_id(&self) -> u32 {
        self.cf_id
    }

    pub(super) fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub(super) fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    /// Picked memtables, oldest first
    pub fn memtables(&self) -> &[Arc<MemTable>] {
        &self.mems
    }

    /// Output file number (0 until memtables are picked)
    pub fn file_number(&self) -> u64 {
        self.meta.number()
    }

    /// True while the job holds its pinned version
    pub fn has_pinned_version(&self) -> bool {
        self.base.is_some()
    }

    pub fn io_status(&self) -> &IoStatus {
        &self.io_status
    }

    pub fn table_properties(&self) -> &TableProperties {
        &self.table_properties
    }

    /// The memtable a successful mempurge added to the list
    pub fn mempurge_output(&self) -> Option<&Arc<MemTable>> {
        self.mempurge_output.as_ref()
    }

    /// Memtables removed from the list by install, to be dropped by the caller
    pub fn take_memtables_to_free(&mut self) -> Vec<Arc<MemTable>> {
        std::mem::take(&mut self.memtables_to_free)
    }

    /// Infos of every flush job whose results this job's install committed
    pub fn committed_flush_jobs(&self) -> &[FlushJobInfo] {
        &self.committed_flush_jobs
    }

    // =========================================================================
    // Pick
    // =========================================================================

    /// Select the memtables to flush. Lock held; call at most once.
    ///
    /// Adopts the oldest picked memtable's edit, allocates the output file
    /// number and pins the current version.
    pub fn pick_memtable(&mut self, db: &mut DbState) {
        debug_assert!(!self.pick_memtable_called, "pick_memtable called twice");
        self.pick_memtable_called = true;

        let Some((versions, cfd)) = db.split_mut(self.cf_id) else {
            warn!(job_id = self.job_id, cf = self.cf_id, "column family not found, nothing to pick");
            return;
        };
        self.cf_name = cfd.name().to_string();
        self.cf_options = Some(Arc::clone(cfd.options()));

        self.mems = cfd.imm_mut().pick_memtables_to_flush(self.max_memtable_id);
        if self.mems.is_empty() {
            return;
        }

        let file_number = match versions.new_file_number() {
            Ok(n) => n,
            Err(e) => {
                warn!(job_id = self.job_id, cf = %self.cf_name, error = %e, "file number reservation failed");
                cfd.imm_mut().rollback_memtable_flush(&self.mems, 0);
                self.mems.clear();
                self.io_status = Err(e);
                return;
            }
        };
        let (Some(oldest), Some(newest)) = (self.mems.first(), self.mems.last()) else {
            return;
        };

        let input_size: usize = self.mems.iter().map(|m| m.approximate_memory_usage()).sum();
        self.stats
            .record_tick(Ticker::FlushInputMemtableBytes, input_size as u64);

        {
            let mut edit = oldest.edit();
            edit.set_prev_log_number(0);
            // Logs below this number are no longer needed for recovery
            edit.set_log_number(newest.next_log_number());
            edit.set_column_family(self.cf_id);
        }

        self.meta = FileMetaData {
            fd: FileDescriptor::new(file_number, 0, 0),
            ..Default::default()
        };

        self.mempurge_input_ids = self
            .mems
            .iter()
            .map(|m| m.id())
            .filter(|&id| cfd.imm().is_mempurge_output(id))
            .collect();
        self.inputs_include_oldest = cfd.imm().starts_with(&self.mems);

        self.base = Some(Arc::clone(cfd.current()));

        debug!(
            job_id = self.job_id,
            cf = %self.cf_name,
            memtables = self.mems.len(),
            file_number = self.meta.number(),
            "picked memtables"
        );
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Execute the job. Lock held on entry and on return; released while the
    /// table is written or memtables are purged.
    pub fn run(&mut self, db: &mut MutexGuard<'_, DbState>) -> FlushOutcome {
        debug_assert!(self.pick_memtable_called, "run called before pick_memtable");

        if self.mems.is_empty() {
            // A failed file number reservation leaves nothing picked
            if let Err(e) = &self.io_status {
                return FlushOutcome {
                    status: Err(FlushError::Io(e.clone())),
                    io_status: self.io_status.clone(),
                    file_meta: None,
                };
            }
            self.log_buffer
                .lock()
                .info(format!("[{}] Nothing in memtable to flush", self.cf_name));
            return FlushOutcome {
                status: Ok(()),
                io_status: Ok(()),
                file_meta: None,
            };
        }

        let flush_reason = db
            .cf(self.cf_id)
            .map_or(FlushReason::Others, |c| c.flush_reason());
        self.flush_reason = flush_reason;

        let mut mempurge_ok = false;
        if self.mempurge_policy != MempurgePolicy::Disabled
            && flush_reason == FlushReason::WriteBufferFull
            && self.should_mempurge()
        {
            match self.mempurge(db) {
                Ok(()) => mempurge_ok = true,
                Err(e) if e.is_aborted() => {
                    info!(job_id = self.job_id, cf = %self.cf_name, error = %e, "mempurge aborted")
                }
                Err(e) => {
                    warn!(job_id = self.job_id, cf = %self.cf_name, error = %e, "mempurge failed")
                }
            }
        }

        let mut status = if mempurge_ok {
            self.base = None;
            Ok(())
        } else {
            self.write_level0_table(db)
        };

        // The only cancellation checkpoint: after the write, before install
        let dropped = db.cf(self.cf_id).map_or(true, |c| c.is_dropped());
        if status.is_ok() && dropped {
            status = Err(FlushError::ColumnFamilyDropped(
                "Column family dropped during flush".to_string(),
            ));
        }
        let overridable = match &status {
            Ok(()) => true,
            Err(e) => e.is_column_family_dropped(),
        };
        if overridable && self.shutting_down.load(Ordering::Acquire) {
            status = Err(FlushError::ShutdownInProgress("Database shutdown".to_string()));
        }

        if status.is_err() {
            if let Some(cfd) = db.cf_mut(self.cf_id) {
                if mempurge_ok {
                    // Undo the substitution so only the inputs remain
                    if let Some(output) = self.mempurge_output.take() {
                        cfd.imm_mut().remove_mempurge_output(&output);
                    }
                    for &id in &self.mempurge_input_ids {
                        cfd.imm_mut().add_mempurge_output_id(id);
                    }
                }
                cfd.imm_mut()
                    .rollback_memtable_flush(&self.mems, self.meta.number());
            }
        } else if self.write_manifest {
            let outcome = db.try_install_memtable_flush_results(
                self.cf_id,
                &self.mems,
                self.meta.number(),
                !mempurge_ok,
            );
            if let Err(e) = outcome.io_status {
                self.io_status = Err(e);
            }
            self.memtables_to_free.extend(outcome.memtables_to_free);
            self.committed_flush_jobs.extend(outcome.committed_flush_jobs);
        }

        let file_meta = status.is_ok().then(|| self.meta.clone());
        self.emit_flush_finished(db, &status, mempurge_ok);

        FlushOutcome {
            status,
            io_status: self.io_status.clone(),
            file_meta,
        }
    }

    /// Abandon a picked job. Lock held.
    ///
    /// Releases the pinned version and returns the picked memtables to the
    /// pending state; the allocated file number is never reused.
    pub fn cancel(&mut self, db: &mut DbState) {
        debug_assert!(self.base.is_some(), "cancel without a pinned version");
        self.base = None;
        if !self.mems.is_empty() {
            if let Some(cfd) = db.cf_mut(self.cf_id) {
                cfd.imm_mut()
                    .rollback_memtable_flush(&self.mems, self.meta.number());
            }
        }
        debug!(job_id = self.job_id, cf = %self.cf_name, "flush job cancelled");
    }

    /// Mempurge policy decision
    pub fn should_mempurge(&self) -> bool {
        match self.mempurge_policy {
            MempurgePolicy::Disabled => false,
            MempurgePolicy::Always => true,
            // Never purge the output of a previous purge again
            MempurgePolicy::Alternate => self.mempurge_input_ids.is_empty(),
        }
    }

    /// GC parameters shared by the mempurge and disk paths
    pub(super) fn gc_options(&self) -> GcOptions {
        let older_data = if self.inputs_include_oldest {
            self.base
                .as_ref()
                .map(|v| Arc::clone(v) as Arc<dyn OlderDataCheck>)
        } else {
            None
        };

        GcOptions {
            snapshots: self.snapshots.clone(),
            merge_operator: self
                .cf_options
                .as_ref()
                .and_then(|o| o.merge_operator.clone()),
            compaction_filter_factory: self
                .cf_options
                .as_ref()
                .and_then(|o| o.compaction_filter_factory.clone()),
            column_family_id: self.cf_id,
            older_data,
        }
    }

    // =========================================================================
    // Disk write
    // =========================================================================

    /// Write the picked memtables to one level-0 file. Lock held on entry and
    /// return; released during the build.
    fn write_level0_table(&mut self, db: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let started = Instant::now();
        let gc = self.gc_options();

        let (status, blob_file_additions) = MutexGuard::unlocked(db, || self.build_level0_table(&gc));

        // Lock reacquired
        self.base = None;

        let has_output = self.meta.file_size() > 0;
        if status.is_ok() && has_output {
            let mut edit = self.mems[0].edit();
            edit.add_file(0, self.meta.clone());
            edit.set_blob_file_additions(blob_file_additions.clone());
        }

        let info = self.flush_job_info();
        self.mems[0].set_flush_job_info(info);

        // Flush is accounted as a level-0 compaction
        let micros = started.elapsed().as_micros() as u64;
        let mut stats = CompactionStats {
            micros,
            cpu_micros: micros,
            count: 1,
            ..Default::default()
        };
        if has_output {
            stats.bytes_written = self.meta.file_size();
            stats.num_output_files = 1;
        }
        stats.bytes_written_blob = blob_file_additions.iter().map(|b| b.total_blob_bytes).sum();
        stats.num_output_files_blob = blob_file_additions.len() as u64;

        info!(
            job_id = self.job_id,
            cf = %self.cf_name,
            micros,
            "Flush lasted {} microseconds",
            micros
        );

        if let Some(cfd) = db.cf_mut(self.cf_id) {
            if status.is_ok() {
                for mem in &self.mems {
                    cfd.imm_mut().remove_mempurge_output_id(mem.id());
                }
            }
            cfd.internal_stats_mut()
                .add_compaction_stats(0, CompactionReason::Flush, &stats);
            cfd.internal_stats_mut()
                .add_bytes_flushed(stats.bytes_written + stats.bytes_written_blob);
        }

        self.stats.measure_time(Histogram::FlushTime, micros);
        self.stats
            .record_tick(Ticker::FlushWriteBytes, stats.bytes_written + stats.bytes_written_blob);

        status
    }

    /// The unlocked part of the disk write
    fn build_level0_table(&mut self, gc: &GcOptions) -> (Result<()>, Vec<BlobFileAddition>) {
        self.log_buffer.lock().flush_buffer_to_log();

        let mut total_num_entries = 0u64;
        let mut total_num_deletes = 0u64;
        let mut total_data_size = 0u64;
        let mut total_memory_usage = 0u64;
        let mut sources = Vec::with_capacity(self.mems.len());
        let mut range_del = RangeDelAggregator::new(gc.snapshots.as_slice());

        for mem in &self.mems {
            info!(
                job_id = self.job_id,
                cf = %self.cf_name,
                next_log_number = mem.next_log_number(),
                "Flushing memtable with next log file: {}",
                mem.next_log_number()
            );
            sources.push(mem.entries());
            range_del.add_tombstones(mem.range_tombstones());
            total_num_entries += mem.num_entries();
            total_num_deletes += mem.num_deletes();
            total_data_size += mem.data_size();
            total_memory_usage += mem.approximate_memory_usage() as u64;
        }

        self.event_sink.emit(FlushEvent::Started(FlushStartedRecord {
            job_id: self.job_id,
            cf_name: self.cf_name.clone(),
            num_memtables: self.mems.len(),
            total_num_input_entries: total_num_entries,
            num_deletes: total_num_deletes,
            total_data_size,
            memory_usage: total_memory_usage,
            flush_reason: self.flush_reason.as_str(),
        }));

        info!(
            job_id = self.job_id,
            cf = %self.cf_name,
            file_number = self.meta.number(),
            "Level-0 flush table #{}: started",
            self.meta.number()
        );

        let current_time = unix_now();
        let oldest_key_time = self.mems[0].oldest_key_time();
        self.meta.oldest_ancester_time = current_time.min(oldest_key_time);
        self.meta.file_creation_time = current_time;

        let request = BuildRequest {
            dir: &self.output_dir,
            input: MergingIterator::new(sources),
            range_del,
            gc,
            reason: TableFileCreationReason::Flush,
            job_id: self.job_id,
            column_family_name: &self.cf_name,
            measure_io_stats: self.measure_io_stats,
        };
        let output = self.table_builder.build_table(request, &mut self.meta);

        if let Err(e) = &output.io_status {
            self.io_status = Err(e.clone());
        }
        let mut status = output.status;
        if status.is_ok() {
            if let Err(e) = &output.io_status {
                status = Err(FlushError::Io(e.clone()));
            }
        }

        if status.is_ok() && output.num_input_entries != total_num_entries {
            let msg = format!(
                "Expected {} entries in memtables, but read {}",
                total_num_entries, output.num_input_entries
            );
            warn!(job_id = self.job_id, cf = %self.cf_name, "Level-0 flush {}", msg);
            if self.flush_verify_memtable_count {
                status = Err(FlushError::Corruption(msg));
            }
        }
        self.stats
            .record_tick(Ticker::MemtablePayloadBytesAtFlush, output.payload_bytes);
        self.stats
            .record_tick(Ticker::MemtableGarbageBytesAtFlush, output.garbage_bytes);

        info!(
            job_id = self.job_id,
            cf = %self.cf_name,
            file_number = self.meta.number(),
            file_size = self.meta.file_size(),
            ok = status.is_ok(),
            "Level-0 flush table #{}: {} bytes{}",
            self.meta.number(),
            self.meta.file_size(),
            if self.meta.marked_for_compaction { " (needs compaction)" } else { "" }
        );

        if status.is_ok() && self.sync_output_directory && self.meta.file_size() > 0 {
            if let Err(e) = sync_dir(&self.output_dir) {
                let e = crate::error::IoError::from(e);
                self.io_status = Err(e.clone());
                status = Err(FlushError::Io(e));
            }
        }

        self.table_properties = output.table_properties;
        self.io_timings = output.io_timings;
        (status, output.blob_file_additions)
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    fn flush_job_info(&self) -> FlushJobInfo {
        let file_number = self.meta.number();
        FlushJobInfo {
            cf_id: self.cf_id,
            cf_name: self.cf_name.clone(),
            file_path: table_file_path(&self.output_dir, file_number),
            file_number,
            oldest_blob_file_number: self.meta.oldest_blob_file_number,
            thread_id: format!("{:?}", std::thread::current().id()),
            job_id: self.job_id,
            smallest_seqno: self.meta.fd.smallest_seqno,
            largest_seqno: self.meta.fd.largest_seqno,
            table_properties: self.table_properties.clone(),
            flush_reason: self.flush_reason,
        }
    }

    fn emit_flush_finished(&self, db: &DbState, status: &Result<()>, mempurge: bool) {
        let (lsm_state, blob_file_head, blob_file_tail, immutable_memtables) = match db.cf(self.cf_id) {
            Some(cfd) => {
                let version = cfd.current();
                let lsm_state = (0..version.num_levels())
                    .map(|level| version.num_level_files(level))
                    .collect();
                let blobs = version.blob_files();
                (
                    lsm_state,
                    blobs.keys().next().copied(),
                    blobs.keys().next_back().copied(),
                    cfd.imm().num_not_flushed(),
                )
            }
            None => (Vec::new(), None, None, 0),
        };

        let file_size = if mempurge { 0 } else { self.meta.file_size() };
        let record = FlushJobRecord {
            job_id: self.job_id,
            cf_name: self.cf_name.clone(),
            flush_reason: self.flush_reason.as_str(),
            lsm_state,
            blob_file_head,
            blob_file_tail,
            immutable_memtables,
            mempurge,
            file_number: (file_size > 0).then(|| self.meta.number()),
            file_size,
            status: match status {
                Ok(()) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
            io_status: match &self.io_status {
                Ok(()) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
            io_timings: if self.measure_io_stats { self.io_timings } else { None },
        };

        self.log_buffer.lock().info(format!(
            "[{}] [JOB {}] flush_finished: {}",
            self.cf_name, self.job_id, record.status
        ));
        self.event_sink.emit(FlushEvent::Finished(record));
    }
}
