//! Table Module
//!
//! Level-0 table files and the table-building seam used by the flush job.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (6 bytes)                                        │
//! │   Magic: "FKVT" (4) | Version: u16 (2)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Seq: u64][Type: u8]        │
//! │   [Key][Value]                                          │
//! │   ... repeated, internal-key order ...                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Range Deletion Block (variable)                         │
//! │   [StartLen: u32][EndLen: u32][Seq: u64][Start][End]    │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Seq: u64][Type: u8][Offset: u64][Key]   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (40 bytes)                                       │
//! │   EntryCount: u64 | RangeDelCount: u64                  │
//! │   RangeDelOffset: u64 | IndexOffset: u64                │
//! │   DataCRC: u32 | Padding (4)                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! DataCRC covers the data and range deletion blocks. The whole-file crc32
//! is recorded separately as the file checksum in the manifest.

mod builder;
mod iterator;
mod reader;
mod writer;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::compaction::{GcOptions, MergingIterator, RangeDelAggregator, TableFileCreationReason};
use crate::error::{IoStatus, Result};
use crate::version::{BlobFileAddition, FileMetaData};

pub use builder::SstTableBuilder;
pub use iterator::TableIterator;
pub use reader::TableReader;
pub use writer::{TableWriter, WriteSummary};

// =============================================================================
// Shared Constants (used by writer, reader, iterator)
// =============================================================================

/// Magic bytes identifying a flushkv table file
pub(crate) const MAGIC: &[u8; 4] = b"FKVT";

/// Current table format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2)
pub(crate) const HEADER_SIZE: u64 = 6;

/// Footer size: 4 x u64 + DataCRC (4) + Padding (4)
pub(crate) const FOOTER_SIZE: u64 = 40;

/// Fixed part of a data entry: KeyLen (4) + ValLen (4) + Seq (8) + Type (1)
pub(crate) const ENTRY_HEADER_SIZE: usize = 17;

/// Name recorded next to the whole-file checksum
pub const FILE_CHECKSUM_FUNC_NAME: &str = "crc32";

/// `{dir}/{number:06}.sst`
pub fn table_file_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

/// fsync a directory so newly created entries survive a crash
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Table building seam
// =============================================================================

/// Summary properties of a built table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_merge_operands: u64,
    pub num_range_deletions: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub data_size: u64,
    pub index_size: u64,
    pub column_family_id: u32,
    pub column_family_name: String,
    pub creation_time: u64,
    pub oldest_key_time: u64,
}

/// Time spent in file I/O while building, when measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoTimings {
    pub write_nanos: u64,
    pub fsync_nanos: u64,
    pub prepare_write_nanos: u64,
    pub cpu_write_nanos: u64,
}

/// Everything a builder needs to turn memtable streams into one file
pub struct BuildRequest<'a> {
    pub dir: &'a Path,
    /// All versions of all picked memtables, in internal-key order
    pub input: MergingIterator,
    pub range_del: RangeDelAggregator,
    pub gc: &'a GcOptions,
    pub reason: TableFileCreationReason,
    pub job_id: u64,
    pub column_family_name: &'a str,
    pub measure_io_stats: bool,
}

/// What a builder reports back
#[derive(Debug)]
pub struct BuildOutput {
    /// Logical outcome (e.g. an unsupported filter or a failed merge)
    pub status: Result<()>,
    /// Filesystem outcome of writing and syncing the file
    pub io_status: IoStatus,
    /// Point entries and range tombstones consumed from the input
    pub num_input_entries: u64,
    pub table_properties: TableProperties,
    pub blob_file_additions: Vec<BlobFileAddition>,
    /// Bytes of surviving keys and values
    pub payload_bytes: u64,
    /// Bytes of versions dropped as garbage
    pub garbage_bytes: u64,
    pub io_timings: Option<IoTimings>,
}

impl Default for BuildOutput {
    fn default() -> Self {
        Self {
            status: Ok(()),
            io_status: Ok(()),
            num_input_entries: 0,
            table_properties: TableProperties::default(),
            blob_file_additions: Vec::new(),
            payload_bytes: 0,
            garbage_bytes: 0,
            io_timings: None,
        }
    }
}

/// Materializes a merged stream as one level-0 table file.
///
/// `meta` arrives with the file number and creation times set; the builder
/// fills in size, key range, counts and checksum. A file with no surviving
/// data must be reported with `file_size == 0`.
pub trait TableFileBuilder: Send + Sync {
    fn build_table(&self, request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput;
}
