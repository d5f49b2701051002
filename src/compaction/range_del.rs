//! Range tombstone aggregation
//!
//! Collects the range tombstones of every input and answers "is this point
//! entry deleted?" with snapshot awareness: a tombstone only shadows entries
//! that fall into the same snapshot stripe, so versions still visible to an
//! older snapshot survive.

use crate::types::{InternalKey, RangeTombstone, SequenceNumber};

/// Index of the snapshot stripe holding `seq` in ascending `snapshots`.
///
/// Two sequence numbers share a stripe when no snapshot separates them.
pub fn snapshot_stripe(snapshots: &[SequenceNumber], seq: SequenceNumber) -> usize {
    snapshots.partition_point(|&s| s < seq)
}

/// Snapshot-striped set of range tombstones
#[derive(Debug, Clone, Default)]
pub struct RangeDelAggregator {
    snapshots: Vec<SequenceNumber>,
    tombstones: Vec<RangeTombstone>,
}

impl RangeDelAggregator {
    /// `snapshots` must be sorted ascending
    pub fn new(snapshots: &[SequenceNumber]) -> Self {
        Self {
            snapshots: snapshots.to_vec(),
            tombstones: Vec::new(),
        }
    }

    pub fn add_tombstones(&mut self, tombstones: impl IntoIterator<Item = RangeTombstone>) {
        self.tombstones.extend(tombstones);
        // start ascending, newest first on ties
        self.tombstones
            .sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.sequence.cmp(&a.sequence)));
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    /// True if a newer tombstone in the same stripe covers `key`
    pub fn should_delete(&self, key: &InternalKey) -> bool {
        let stripe = snapshot_stripe(&self.snapshots, key.sequence);
        self.tombstones
            .iter()
            .take_while(|t| t.start.as_ref() <= key.user_key.as_ref())
            .any(|t| {
                t.sequence > key.sequence
                    && t.contains(&key.user_key)
                    && snapshot_stripe(&self.snapshots, t.sequence) == stripe
            })
    }

    /// All tombstones, sorted by start key then newest first
    pub fn tombstones(&self) -> &[RangeTombstone] {
        &self.tombstones
    }
}
