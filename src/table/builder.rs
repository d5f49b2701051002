//! Default table builder
//!
//! Runs the GC engine over the merged memtable stream and writes the
//! survivors to one level-0 table file.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, warn};

use crate::compaction::CompactionIterator;
use crate::types::{Entry, ValueType};
use crate::version::FileMetaData;

use super::writer::{TableWriter, WriteSummary};
use super::{
    table_file_path, BuildOutput, BuildRequest, IoTimings, TableFileBuilder, TableProperties,
    FILE_CHECKSUM_FUNC_NAME, FOOTER_SIZE, HEADER_SIZE,
};

/// Writes level-0 table files in the flushkv format
#[derive(Debug, Clone, Default)]
pub struct SstTableBuilder {
    _private: (),
}

impl SstTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableFileBuilder for SstTableBuilder {
    fn build_table(&self, request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput {
        let started = Instant::now();
        let BuildRequest {
            dir,
            input,
            range_del,
            gc,
            reason,
            job_id,
            column_family_name,
            measure_io_stats,
        } = request;

        let mut output = BuildOutput::default();
        let path = table_file_path(dir, meta.number());

        let filter = gc.create_filter(reason);
        let mut iter = match CompactionIterator::new(input, range_del, gc, filter) {
            Ok(iter) => iter,
            Err(e) => {
                output.status = Err(e);
                return output;
            }
        };

        let mut props = TableProperties {
            column_family_id: gc.column_family_id,
            column_family_name: column_family_name.to_string(),
            creation_time: meta.file_creation_time,
            oldest_key_time: meta.oldest_ancester_time,
            ..Default::default()
        };

        let written = write_table(&path, &mut iter, meta, &mut props, started);

        output.num_input_entries =
            iter.num_input_entries() + iter.num_input_range_tombstones() as u64;
        output.garbage_bytes = iter.stats().total_dropped_bytes;
        output.status = iter.into_status();

        match written {
            Ok(Some((summary, prepare_write_nanos))) if output.status.is_ok() => {
                fill_file_meta(meta, &summary, &props);
                props.num_entries = summary.entry_count;
                props.num_range_deletions = summary.range_del_count;
                props.index_size = summary.index_size;
                props.data_size = summary.file_size - summary.index_size - HEADER_SIZE - FOOTER_SIZE;
                output.payload_bytes = props.raw_key_size + props.raw_value_size;

                if measure_io_stats {
                    let total = started.elapsed().as_nanos() as u64;
                    output.io_timings = Some(IoTimings {
                        write_nanos: summary.write_nanos,
                        fsync_nanos: summary.fsync_nanos,
                        prepare_write_nanos,
                        cpu_write_nanos: total.saturating_sub(
                            prepare_write_nanos + summary.write_nanos + summary.fsync_nanos,
                        ),
                    });
                }

                debug!(
                    job_id,
                    file_number = meta.number(),
                    file_size = meta.file_size(),
                    entries = summary.entry_count,
                    range_deletions = summary.range_del_count,
                    "wrote level-0 table"
                );
            }
            Ok(_) => {
                // Nothing survived, or the GC pass failed
                remove_output(&path);
                meta.fd.file_size = 0;
            }
            Err(e) => {
                warn!(job_id, file_number = meta.number(), error = %e, "table write failed");
                remove_output(&path);
                meta.fd.file_size = 0;
                output.io_status = Err(e.into());
            }
        }

        output.table_properties = props;
        output
    }
}

/// Drain `iter` into a new file. `Ok(None)` when there is nothing to keep.
///
/// Also returns the nanoseconds from `started` until the file was open.
fn write_table<I>(
    path: &Path,
    iter: &mut CompactionIterator<I>,
    meta: &mut FileMetaData,
    props: &mut TableProperties,
    started: Instant,
) -> io::Result<Option<(WriteSummary, u64)>>
where
    I: Iterator<Item = Entry>,
{
    let mut writer = TableWriter::create(path)?;
    let prepare_write_nanos = (started.elapsed().as_nanos() as u64).max(1);

    for entry in iter.by_ref() {
        meta.update_boundaries(&entry.key);
        props.raw_key_size += entry.key.user_key.len() as u64;
        props.raw_value_size += entry.value.len() as u64;
        match entry.value_type() {
            ValueType::Deletion => props.num_deletions += 1,
            ValueType::Merge => props.num_merge_operands += 1,
            ValueType::Value => {}
        }
        writer.add(&entry)?;
    }

    if iter.status().is_err() {
        return Ok(None);
    }

    let tombstones = iter.output_range_tombstones();
    for t in &tombstones {
        meta.update_boundaries_with_tombstone(t);
        writer.add_range_tombstone(t);
    }

    if writer.entry_count() == 0 && tombstones.is_empty() {
        return Ok(None);
    }

    writer.finish().map(|summary| Some((summary, prepare_write_nanos)))
}

fn fill_file_meta(meta: &mut FileMetaData, summary: &WriteSummary, props: &TableProperties) {
    meta.fd.file_size = summary.file_size;
    meta.num_entries = summary.entry_count;
    meta.num_deletions = props.num_deletions + summary.range_del_count;
    meta.num_range_deletions = summary.range_del_count;
    meta.file_checksum = format!("{:08x}", summary.file_crc);
    meta.file_checksum_func_name = FILE_CHECKSUM_FUNC_NAME.to_string();

    // Mostly deletions: worth compacting away soon
    let total = summary.entry_count + summary.range_del_count;
    meta.marked_for_compaction = total > 0 && meta.num_deletions * 2 > total;
}

fn remove_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove table output"),
    }
}
