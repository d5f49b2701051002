//! Compaction filters
//!
//! A filter inspects each surviving value and may drop or rewrite it. Only
//! filters that ignore snapshots are accepted by the flush path: a filter
//! that wanted to respect snapshots could not be applied correctly while
//! older versions are being collapsed.

use bytes::Bytes;

/// Why a table file is being created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFileCreationReason {
    Flush,
    Compaction,
    Recovery,
    Misc,
}

/// Verdict of a filter on one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    /// Drop the value; a deletion marker is written in its place
    Remove,
    ChangeValue(Bytes),
}

/// Information handed to a filter factory
#[derive(Debug, Clone)]
pub struct CompactionFilterContext {
    pub is_full_compaction: bool,
    pub is_manual_compaction: bool,
    pub column_family_id: u32,
    pub reason: TableFileCreationReason,
}

pub trait CompactionFilter: Send {
    fn filter(&self, level: usize, key: &[u8], value: &[u8]) -> FilterDecision;

    /// Must be true for filters used during flush
    fn ignore_snapshots(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

pub trait CompactionFilterFactory: Send + Sync {
    fn create_compaction_filter(
        &self,
        context: &CompactionFilterContext,
    ) -> Option<Box<dyn CompactionFilter>>;

    fn should_filter_table_file_creation(&self, reason: TableFileCreationReason) -> bool {
        reason == TableFileCreationReason::Compaction
    }

    fn name(&self) -> &str;
}
