//! Version edits and file metadata
//!
//! A [`VersionEdit`] accumulates the manifest mutations produced by one flush:
//! the new level-0 file, any blob files written alongside it, and the new
//! write-ahead-log floor.

use serde::{Deserialize, Serialize};

use crate::types::{InternalKey, RangeTombstone, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER};

/// Identifies a table file and its sequence range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub number: u64,
    pub path_id: u32,
    pub file_size: u64,
    pub smallest_seqno: SequenceNumber,
    pub largest_seqno: SequenceNumber,
}

impl FileDescriptor {
    pub fn new(number: u64, path_id: u32, file_size: u64) -> Self {
        Self {
            number,
            path_id,
            file_size,
            smallest_seqno: MAX_SEQUENCE_NUMBER,
            largest_seqno: 0,
        }
    }
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

/// Metadata of a (prospective) table file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    pub fd: FileDescriptor,
    /// Smallest internal key (None until something is written)
    pub smallest: Option<InternalKey>,
    /// Largest internal key
    pub largest: Option<InternalKey>,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_range_deletions: u64,
    /// Set by the builder when the file should be compacted soon
    pub marked_for_compaction: bool,
    pub oldest_blob_file_number: u64,
    pub oldest_ancester_time: u64,
    pub file_creation_time: u64,
    pub file_checksum: String,
    pub file_checksum_func_name: String,
}

impl FileMetaData {
    pub fn number(&self) -> u64 {
        self.fd.number
    }

    pub fn file_size(&self) -> u64 {
        self.fd.file_size
    }

    /// Extend the key/sequence range with one written key
    pub fn update_boundaries(&mut self, key: &InternalKey) {
        if self.smallest.as_ref().map_or(true, |s| key < s) {
            self.smallest = Some(key.clone());
        }
        if self.largest.as_ref().map_or(true, |l| key > l) {
            self.largest = Some(key.clone());
        }
        self.fd.smallest_seqno = self.fd.smallest_seqno.min(key.sequence);
        self.fd.largest_seqno = self.fd.largest_seqno.max(key.sequence);
    }

    /// Extend the range with a range tombstone covering `[start, end)`.
    ///
    /// The end becomes a sentinel at `MAX_SEQUENCE_NUMBER`, which sorts
    /// before every real entry for that user key.
    pub fn update_boundaries_with_tombstone(&mut self, tombstone: &RangeTombstone) {
        let start = InternalKey::new(tombstone.start.clone(), tombstone.sequence, ValueType::Deletion);
        let end = InternalKey::new(tombstone.end.clone(), MAX_SEQUENCE_NUMBER, ValueType::Deletion);
        if self.smallest.as_ref().map_or(true, |s| &start < s) {
            self.smallest = Some(start);
        }
        if self.largest.as_ref().map_or(true, |l| &end > l) {
            self.largest = Some(end);
        }
        self.fd.smallest_seqno = self.fd.smallest_seqno.min(tombstone.sequence);
        self.fd.largest_seqno = self.fd.largest_seqno.max(tombstone.sequence);
    }

    /// True if the largest key is a range tombstone's exclusive end
    pub fn largest_is_range_end(&self) -> bool {
        self.largest
            .as_ref()
            .map_or(false, |l| l.sequence == MAX_SEQUENCE_NUMBER)
    }

    /// True if `user_key` falls inside the file's key range
    pub fn contains_user_key(&self, user_key: &[u8]) -> bool {
        match (&self.smallest, &self.largest) {
            (Some(s), Some(l)) => {
                let below_largest = if self.largest_is_range_end() {
                    user_key < l.user_key.as_ref()
                } else {
                    user_key <= l.user_key.as_ref()
                };
                user_key >= s.user_key.as_ref() && below_largest
            }
            _ => false,
        }
    }
}

/// A blob file produced alongside a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobFileAddition {
    pub blob_file_number: u64,
    pub total_blob_count: u64,
    pub total_blob_bytes: u64,
    pub checksum_method: String,
    pub checksum_value: String,
}

/// Pending manifest mutations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    column_family: u32,
    log_number: Option<u64>,
    prev_log_number: Option<u64>,
    new_files: Vec<(usize, FileMetaData)>,
    blob_file_additions: Vec<BlobFileAddition>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to an empty edit (used when a flush is rolled back)
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.log_number.is_none()
            && self.prev_log_number.is_none()
            && self.new_files.is_empty()
            && self.blob_file_additions.is_empty()
    }

    pub fn set_column_family(&mut self, id: u32) {
        self.column_family = id;
    }

    pub fn column_family(&self) -> u32 {
        self.column_family
    }

    /// Logs with a number smaller than `num` are no longer needed for recovery
    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn log_number(&self) -> Option<u64> {
        self.log_number
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn prev_log_number(&self) -> Option<u64> {
        self.prev_log_number
    }

    pub fn add_file(&mut self, level: usize, meta: FileMetaData) {
        self.new_files.push((level, meta));
    }

    pub fn new_files(&self) -> &[(usize, FileMetaData)] {
        &self.new_files
    }

    pub fn set_blob_file_additions(&mut self, additions: Vec<BlobFileAddition>) {
        self.blob_file_additions = additions;
    }

    pub fn blob_file_additions(&self) -> &[BlobFileAddition] {
        &self.blob_file_additions
    }
}
