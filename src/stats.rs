//! Accounting and telemetry
//!
//! - [`Statistics`]: process-wide tickers and histograms
//! - [`InternalStats`]: per-column-family, per-level compaction stats (a
//!   flush is accounted as a level-0 compaction)
//! - [`EventSink`]: fire-and-forget receiver of structured flush events

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::table::IoTimings;
use crate::version::NUM_LEVELS;

// =============================================================================
// Statistics
// =============================================================================

/// Counters maintained by flush jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticker {
    /// Bytes of level-0 table files written by flushes
    FlushWriteBytes,
    /// Surviving key and value bytes of flushed memtables
    MemtablePayloadBytesAtFlush,
    /// Bytes of flushed memtables dropped as garbage
    MemtableGarbageBytesAtFlush,
    /// Memory held by memtables picked for flush
    FlushInputMemtableBytes,
    /// Flushes replaced by an in-memory purge
    MempurgeSuccesses,
    MempurgeAborts,
}

const NUM_TICKERS: usize = 6;

impl Ticker {
    fn index(self) -> usize {
        self as usize
    }
}

/// Timing distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Histogram {
    /// Microseconds spent in the disk-write path
    FlushTime,
    /// Microseconds spent in mempurge
    MempurgeTime,
}

/// Largest recordable duration: one hour in microseconds
const MAX_MICROS: u64 = 3_600_000_000;

/// Significant figures kept by the histograms
const SIGFIG: u8 = 3;

/// Summary of one timing distribution
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramData {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p99: u64,
}

/// Shared statistics object
#[derive(Debug, Default)]
pub struct Statistics {
    tickers: [AtomicU64; NUM_TICKERS],
    flush_time: Mutex<Option<hdrhistogram::Histogram<u64>>>,
    mempurge_time: Mutex<Option<hdrhistogram::Histogram<u64>>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, ticker: Ticker, count: u64) {
        self.tickers[ticker.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_ticker_count(&self, ticker: Ticker) -> u64 {
        self.tickers[ticker.index()].load(Ordering::Relaxed)
    }

    /// Record a duration; values above one hour saturate
    pub fn measure_time(&self, histogram: Histogram, micros: u64) {
        let mut slot = self.slot(histogram).lock();
        if slot.is_none() {
            match hdrhistogram::Histogram::new_with_bounds(1, MAX_MICROS, SIGFIG) {
                Ok(h) => *slot = Some(h),
                Err(e) => {
                    warn!(?histogram, error = %e, "could not create histogram");
                    return;
                }
            }
        }
        if let Some(h) = slot.as_mut() {
            h.saturating_record(micros.min(MAX_MICROS));
        }
    }

    pub fn histogram_data(&self, histogram: Histogram) -> HistogramData {
        match self.slot(histogram).lock().as_ref() {
            Some(h) => HistogramData {
                count: h.len(),
                min: h.min(),
                max: h.max(),
                mean: h.mean(),
                p50: h.value_at_quantile(0.50),
                p99: h.value_at_quantile(0.99),
            },
            None => HistogramData::default(),
        }
    }

    fn slot(&self, histogram: Histogram) -> &Mutex<Option<hdrhistogram::Histogram<u64>>> {
        match histogram {
            Histogram::FlushTime => &self.flush_time,
            Histogram::MempurgeTime => &self.mempurge_time,
        }
    }
}

// =============================================================================
// Internal stats
// =============================================================================

/// What produced a [`CompactionStats`] sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    Flush,
}

/// Work done by one compaction (or flush) at one level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub micros: u64,
    pub cpu_micros: u64,
    pub bytes_written: u64,
    pub bytes_written_blob: u64,
    pub num_output_files: u64,
    pub num_output_files_blob: u64,
    pub num_input_records: u64,
    pub num_dropped_records: u64,
    pub count: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: &CompactionStats) {
        self.micros += other.micros;
        self.cpu_micros += other.cpu_micros;
        self.bytes_written += other.bytes_written;
        self.bytes_written_blob += other.bytes_written_blob;
        self.num_output_files += other.num_output_files;
        self.num_output_files_blob += other.num_output_files_blob;
        self.num_input_records += other.num_input_records;
        self.num_dropped_records += other.num_dropped_records;
        self.count += other.count;
    }
}

/// Per-column-family accounting, guarded by the db mutex
#[derive(Debug, Clone)]
pub struct InternalStats {
    levels: Vec<CompactionStats>,
    bytes_flushed: u64,
    num_flushes: u64,
    num_mempurges: u64,
}

impl InternalStats {
    pub fn new() -> Self {
        Self {
            levels: vec![CompactionStats::default(); NUM_LEVELS],
            bytes_flushed: 0,
            num_flushes: 0,
            num_mempurges: 0,
        }
    }

    pub fn add_compaction_stats(&mut self, level: usize, reason: CompactionReason, stats: &CompactionStats) {
        if let Some(slot) = self.levels.get_mut(level) {
            slot.add(stats);
        }
        if reason == CompactionReason::Flush {
            self.num_flushes += 1;
        }
    }

    pub fn add_bytes_flushed(&mut self, bytes: u64) {
        self.bytes_flushed += bytes;
    }

    pub fn record_mempurge(&mut self) {
        self.num_mempurges += 1;
    }

    pub fn level_stats(&self, level: usize) -> Option<&CompactionStats> {
        self.levels.get(level)
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.bytes_flushed
    }

    pub fn num_flushes(&self) -> u64 {
        self.num_flushes
    }

    pub fn num_mempurges(&self) -> u64 {
        self.num_mempurges
    }
}

impl Default for InternalStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Emitted once memtables are picked and the job starts running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushStartedRecord {
    pub job_id: u64,
    pub cf_name: String,
    pub num_memtables: usize,
    pub total_num_input_entries: u64,
    pub num_deletes: u64,
    pub total_data_size: u64,
    pub memory_usage: u64,
    pub flush_reason: &'static str,
}

/// Completion record, emitted whatever the outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushJobRecord {
    pub job_id: u64,
    pub cf_name: String,
    pub flush_reason: &'static str,
    /// Files per level after the job
    pub lsm_state: Vec<usize>,
    /// Oldest and newest blob file numbers of the current version
    pub blob_file_head: Option<u64>,
    pub blob_file_tail: Option<u64>,
    pub immutable_memtables: usize,
    pub mempurge: bool,
    pub file_number: Option<u64>,
    pub file_size: u64,
    /// Logical status, `"OK"` on success
    pub status: String,
    pub io_status: String,
    pub io_timings: Option<IoTimings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushEvent {
    Started(FlushStartedRecord),
    Finished(FlushJobRecord),
}

impl FlushEvent {
    pub fn job_id(&self) -> u64 {
        match self {
            FlushEvent::Started(r) => r.job_id,
            FlushEvent::Finished(r) => r.job_id,
        }
    }
}

/// Receives flush events; nothing it returns is consumed
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlushEvent);
}

/// Logs each event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: FlushEvent) {
        match event {
            FlushEvent::Started(r) => info!(
                event = "flush_started",
                job_id = r.job_id,
                cf = %r.cf_name,
                num_memtables = r.num_memtables,
                num_entries = r.total_num_input_entries,
                num_deletes = r.num_deletes,
                total_data_size = r.total_data_size,
                memory_usage = r.memory_usage,
                flush_reason = r.flush_reason,
            ),
            FlushEvent::Finished(r) => info!(
                event = "flush_finished",
                job_id = r.job_id,
                cf = %r.cf_name,
                flush_reason = r.flush_reason,
                lsm_state = ?r.lsm_state,
                blob_file_head = ?r.blob_file_head,
                blob_file_tail = ?r.blob_file_tail,
                immutable_memtables = r.immutable_memtables,
                mempurge = r.mempurge,
                file_number = ?r.file_number,
                file_size = r.file_size,
                status = %r.status,
                io_status = %r.io_status,
                io_timings = ?r.io_timings,
            ),
        }
    }
}

/// Forwards events over a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: Sender<FlushEvent>,
}

impl ChannelEventSink {
    /// Unbounded sink and its receiving end
    pub fn new() -> (Self, Receiver<FlushEvent>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }

    /// Bounded sink; events are dropped while the channel is full
    pub fn bounded(capacity: usize) -> (Self, Receiver<FlushEvent>) {
        let (tx, rx) = channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: FlushEvent) {
        // Fire-and-forget: a full or disconnected channel just loses the event
        let _ = self.tx.try_send(event);
    }
}
