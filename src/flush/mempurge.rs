//! Mempurge: in-memory compaction of the picked memtables
//!
//! The picked memtables are run through the same GC engine as the disk
//! path; if the survivors fit in one write buffer they replace the inputs in
//! the immutable list and nothing is written to disk.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, info};

use crate::column_family::DbState;
use crate::compaction::{
    CompactionIterator, GcOptions, MergingIterator, RangeDelAggregator, TableFileCreationReason,
};
use crate::error::{FlushError, Result};
use crate::memtable::MemTable;
use crate::stats::{Histogram, Ticker};
use crate::types::MAX_SEQUENCE_NUMBER;

use super::FlushJob;

fn filled_more_than_one_memtable() -> FlushError {
    FlushError::Aborted("Mempurge filled more than one memtable.".to_string())
}

impl FlushJob {
    /// Try to replace the picked memtables with one smaller memtable.
    ///
    /// Lock held on entry and return; released for the merge. `Aborted`
    /// means the output did not fit and the caller falls back to a disk
    /// flush. An empty output is discarded and counts as success.
    pub(super) fn mempurge(&mut self, db: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let started = Instant::now();
        let gc = self.gc_options();

        let result = MutexGuard::unlocked(db, || self.purge_memtables(&gc));

        // Lock reacquired
        let mut capacity_used = 0.0;
        let status = match result {
            Ok(output) => {
                if let Some(cfd) = db.cf_mut(self.column_family_id()) {
                    for mem in &self.mems {
                        cfd.imm_mut().remove_mempurge_output_id(mem.id());
                    }
                    if let Some(new_mem) = &output {
                        cfd.imm_mut().add_mempurge_output_id(new_mem.id());
                        // A substitution, not new data: no flush is requested
                        cfd.imm_mut().add(Arc::clone(new_mem), false);
                        capacity_used = new_mem.approximate_memory_usage() as f64
                            / self.write_buffer_size() as f64;
                    }
                    cfd.internal_stats_mut().record_mempurge();
                }
                self.mempurge_output = output;
                self.stats.record_tick(Ticker::MempurgeSuccesses, 1);
                Ok(())
            }
            Err(e) => {
                if e.is_aborted() {
                    capacity_used = 1.0;
                    self.stats.record_tick(Ticker::MempurgeAborts, 1);
                }
                Err(e)
            }
        };

        let micros = started.elapsed().as_micros() as u64;
        self.stats.measure_time(Histogram::MempurgeTime, micros);
        info!(
            job_id = self.job_id(),
            cf = %self.cf_name(),
            micros,
            ok = status.is_ok(),
            capacity_used,
            "Mempurge lasted {} microseconds",
            micros
        );

        status
    }

    /// The unlocked part of mempurge. `Ok(None)` when nothing survives.
    fn purge_memtables(&self, gc: &GcOptions) -> Result<Option<Arc<MemTable>>> {
        let max_size = self.write_buffer_size();

        let mut sources = Vec::with_capacity(self.mems.len());
        let mut range_del = RangeDelAggregator::new(gc.snapshots.as_slice());
        let mut earliest_seqno = MAX_SEQUENCE_NUMBER;
        for mem in &self.mems {
            sources.push(mem.entries());
            range_del.add_tombstones(mem.range_tombstones());
            earliest_seqno = earliest_seqno.min(mem.earliest_sequence());
        }

        if sources.iter().all(Vec::is_empty) && range_del.is_empty() {
            return Ok(None);
        }
        let input = MergingIterator::new(sources);

        let filter = gc.create_filter(TableFileCreationReason::Flush);
        let mut iter = CompactionIterator::new(input, range_del, gc, filter)?;

        // Inherit the smallest input id so the output keeps its place in age
        // order
        let new_id = self.mems.iter().map(|m| m.id()).min().unwrap_or_default();
        let new_mem = MemTable::new(new_id, earliest_seqno, max_size);
        if let Some(newest) = self.mems.last() {
            new_mem.set_next_log_number(newest.next_log_number());
        }

        for entry in iter.by_ref() {
            new_mem.add(
                entry.sequence(),
                entry.value_type(),
                entry.key.user_key,
                entry.value,
            )?;
            if new_mem.approximate_memory_usage() > max_size {
                return Err(filled_more_than_one_memtable());
            }
        }

        let tombstones = iter.output_range_tombstones();
        let dropped = iter.stats().num_record_drop_hidden
            + iter.stats().num_record_drop_range_del
            + iter.stats().num_record_drop_obsolete;
        iter.into_status()?;

        for t in tombstones {
            new_mem.delete_range(t.sequence, t.start, t.end)?;
            if new_mem.approximate_memory_usage() > max_size {
                return Err(filled_more_than_one_memtable());
            }
        }

        if new_mem.is_empty() {
            debug!(job_id = self.job_id(), dropped, "mempurge output is empty");
            return Ok(None);
        }

        // Must not be full the moment it is added
        if new_mem.should_flush_now() {
            return Err(filled_more_than_one_memtable());
        }

        debug!(
            job_id = self.job_id(),
            memtable = new_mem.id(),
            entries = new_mem.num_entries(),
            dropped,
            "mempurge output built"
        );
        Ok(Some(Arc::new(new_mem)))
    }
}
