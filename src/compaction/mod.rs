//! Compaction Module
//!
//! The visibility / garbage collection engine shared by both flush paths.
//!
//! ## Pipeline
//! ```text
//! memtable entries ──┐
//! memtable entries ──┼─> MergingIterator ──> CompactionIterator ──> output
//! memtable entries ──┘         (all versions)      │
//!                                                  ├─ RangeDelAggregator
//!                                                  ├─ MergeOperator
//!                                                  └─ CompactionFilter
//! ```
//!
//! The mempurge path and the level-0 table builder both run this pipeline
//! with the same [`GcOptions`], so they agree on which versions survive.

mod compaction_iterator;
mod filter;
mod merge_operator;
mod merging_iterator;
mod range_del;

use std::fmt;
use std::sync::Arc;

use crate::types::{SequenceNumber, MAX_SEQUENCE_NUMBER};
use crate::version::Version;

pub use compaction_iterator::{CompactionIterationStats, CompactionIterator};
pub use filter::{
    CompactionFilter, CompactionFilterContext, CompactionFilterFactory, FilterDecision,
    TableFileCreationReason,
};
pub use merge_operator::{MergeOperator, StringAppendOperator};
pub use merging_iterator::MergingIterator;
pub use range_del::{snapshot_stripe, RangeDelAggregator};

/// Snapshot sequence numbers that must stay readable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSet {
    snapshots: Vec<SequenceNumber>,
}

impl SnapshotSet {
    pub fn new(mut snapshots: Vec<SequenceNumber>) -> Self {
        snapshots.sort_unstable();
        snapshots.dedup();
        Self { snapshots }
    }

    /// Ascending
    pub fn as_slice(&self) -> &[SequenceNumber] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Oldest live snapshot, or `MAX_SEQUENCE_NUMBER` when there is none
    pub fn earliest(&self) -> SequenceNumber {
        self.snapshots.first().copied().unwrap_or(MAX_SEQUENCE_NUMBER)
    }
}

/// Answers whether data older than the GC inputs may exist elsewhere.
///
/// Tombstones can only be dropped when this says no.
pub trait OlderDataCheck: Send + Sync {
    fn key_may_exist_beyond_inputs(&self, user_key: &[u8]) -> bool;

    fn range_may_exist_beyond_inputs(&self, start: &[u8], end: &[u8]) -> bool;
}

/// A version answers for the table files it references
impl OlderDataCheck for Version {
    fn key_may_exist_beyond_inputs(&self, user_key: &[u8]) -> bool {
        self.overlaps_user_key(user_key)
    }

    fn range_may_exist_beyond_inputs(&self, start: &[u8], end: &[u8]) -> bool {
        self.overlaps_range(start, end)
    }
}

/// Parameters shared by every GC pass of one flush job
#[derive(Clone, Default)]
pub struct GcOptions {
    pub snapshots: SnapshotSet,
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    pub compaction_filter_factory: Option<Arc<dyn CompactionFilterFactory>>,
    pub column_family_id: u32,
    /// `None` means nothing may be assumed about data outside the inputs
    pub older_data: Option<Arc<dyn OlderDataCheck>>,
}

impl GcOptions {
    /// Filter for a table file created for `reason`, if the factory wants one
    pub fn create_filter(&self, reason: TableFileCreationReason) -> Option<Box<dyn CompactionFilter>> {
        let factory = self.compaction_filter_factory.as_ref()?;
        if !factory.should_filter_table_file_creation(reason) {
            return None;
        }
        factory.create_compaction_filter(&CompactionFilterContext {
            is_full_compaction: false,
            is_manual_compaction: false,
            column_family_id: self.column_family_id,
            reason,
        })
    }
}

impl fmt::Debug for GcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcOptions")
            .field("snapshots", &self.snapshots)
            .field("merge_operator", &self.merge_operator.as_ref().map(|m| m.name().to_string()))
            .field(
                "compaction_filter_factory",
                &self.compaction_filter_factory.as_ref().map(|c| c.name().to_string()),
            )
            .field("column_family_id", &self.column_family_id)
            .field("older_data", &self.older_data.is_some())
            .finish()
    }
}
