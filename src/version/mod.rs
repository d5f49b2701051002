//! Version Module
//!
//! On-disk structural metadata: which table files live at which level.
//!
//! ## Responsibilities
//! - Immutable [`Version`] snapshots shared through `Arc` (a pinned version
//!   is simply a held `Arc<Version>`)
//! - File number allocation (strictly increasing, never reused)
//! - Applying [`VersionEdit`]s and persisting them to the manifest

mod edit;
mod manifest;

use std::collections::BTreeMap;
use std::io;

use tracing::debug;

use crate::error::IoError;

pub use edit::{BlobFileAddition, FileDescriptor, FileMetaData, VersionEdit};
pub use manifest::{ManifestLog, ManifestRecord, ManifestWriter, RECORD_HEADER_SIZE};

/// Number of levels tracked per column family
pub const NUM_LEVELS: usize = 7;

/// File numbers reserved in the manifest per reservation record
pub const FILE_NUMBER_RESERVATION: u64 = 64;

/// A consistent view of the files of one column family
#[derive(Debug, Clone)]
pub struct Version {
    files: Vec<Vec<FileMetaData>>,
    blob_files: BTreeMap<u64, BlobFileAddition>,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            blob_files: BTreeMap::new(),
        }
    }

    /// Build the successor version with `edit` applied
    pub fn apply(&self, edit: &VersionEdit) -> Version {
        let mut next = self.clone();
        for (level, meta) in edit.new_files() {
            // Newest level-0 files first
            next.files[*level].insert(0, meta.clone());
        }
        for blob in edit.blob_file_additions() {
            next.blob_files.insert(blob.blob_file_number, blob.clone());
        }
        next
    }

    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.files.get(level).map_or(0, Vec::len)
    }

    pub fn files(&self, level: usize) -> &[FileMetaData] {
        self.files.get(level).map_or(&[], Vec::as_slice)
    }

    pub fn blob_files(&self) -> &BTreeMap<u64, BlobFileAddition> {
        &self.blob_files
    }

    /// True if any file at any level may contain `user_key`
    pub fn overlaps_user_key(&self, user_key: &[u8]) -> bool {
        self.files
            .iter()
            .flatten()
            .any(|f| f.contains_user_key(user_key))
    }

    /// True if any file intersects `[start, end)`
    pub fn overlaps_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.files.iter().flatten().any(|f| match (&f.smallest, &f.largest) {
            (Some(s), Some(l)) => {
                let below_largest = if f.largest_is_range_end() {
                    start < l.user_key.as_ref()
                } else {
                    start <= l.user_key.as_ref()
                };
                s.user_key.as_ref() < end && below_largest
            }
            _ => false,
        })
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::empty()
    }
}

/// File numbering and manifest application
///
/// Always accessed under the shared db mutex. Every number handed out lies
/// below a limit already durable in the manifest, so a number is never
/// reused across restarts even when its job rolled back.
pub struct VersionSet {
    next_file_number: u64,
    /// Durable upper bound on allocated file numbers
    reserved_file_number: u64,
    manifest: Box<dyn ManifestWriter>,
    records_written: u64,
}

impl VersionSet {
    pub fn new(manifest: Box<dyn ManifestWriter>) -> Self {
        Self {
            next_file_number: 1,
            reserved_file_number: 1,
            manifest,
            records_written: 0,
        }
    }

    /// Allocate a globally unique file number
    ///
    /// Writes a reservation record first when the durable limit is reached.
    /// On failure nothing is allocated.
    pub fn new_file_number(&mut self) -> std::result::Result<u64, IoError> {
        if self.next_file_number >= self.reserved_file_number {
            let limit = self.next_file_number + FILE_NUMBER_RESERVATION;
            self.write_record(ManifestRecord::new(Vec::new(), limit))?;
            self.reserved_file_number = limit;
            debug!(next_file_number = limit, "reserved file numbers");
        }
        let n = self.next_file_number;
        self.next_file_number += 1;
        Ok(n)
    }

    /// The number the next allocation will return
    pub fn peek_next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Ensure future allocations are above `n` (e.g. after recovery)
    pub fn mark_file_number_used(&mut self, n: u64) {
        if self.next_file_number <= n {
            self.next_file_number = n + 1;
        }
        self.reserved_file_number = self.reserved_file_number.max(self.next_file_number);
    }

    /// Restore the counter from a replayed record; allocations resume at
    /// the limit it made durable
    pub fn recover_next_file_number(&mut self, next_file_number: u64) {
        if next_file_number > 0 {
            self.mark_file_number_used(next_file_number - 1);
        }
    }

    /// Persist `edits` as one manifest record and return the version that
    /// results from applying them to `base`. On failure nothing changes.
    pub fn log_and_apply(
        &mut self,
        base: &Version,
        edits: &[VersionEdit],
    ) -> std::result::Result<Version, IoError> {
        let mut next_file_number = self.next_file_number.max(self.reserved_file_number);
        for edit in edits {
            for (_, meta) in edit.new_files() {
                next_file_number = next_file_number.max(meta.number() + 1);
            }
        }
        self.write_record(ManifestRecord::new(edits.to_vec(), next_file_number))?;

        let mut next = base.clone();
        for edit in edits {
            next = next.apply(edit);
            for (_, meta) in edit.new_files() {
                self.mark_file_number_used(meta.number());
            }
        }

        debug!(
            edits = edits.len(),
            records = self.records_written,
            level0_files = next.num_level_files(0),
            "applied version edits"
        );
        Ok(next)
    }

    fn write_record(&mut self, record: ManifestRecord) -> std::result::Result<(), IoError> {
        let payload = bincode::serialize(&record)
            .map_err(|e| IoError::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.manifest.add_record(&payload)?;
        self.manifest.sync()?;
        self.records_written += 1;
        Ok(())
    }
}
