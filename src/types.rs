//! Key and entry types shared by memtables, the GC engine and table files.
//!
//! ## Ordering
//! Internal keys sort by user key ascending, then sequence number descending
//! (newest version first), then value type descending.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Monotonically increasing write sequence number
pub type SequenceNumber = u64;

/// Largest representable sequence number (also "no sequence seen yet")
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Kind of a point entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Point deletion
    Deletion = 0,

    /// Full value
    Value = 1,

    /// Merge operand
    Merge = 2,
}

impl ValueType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            2 => Some(ValueType::Merge),
            _ => None,
        }
    }
}

/// A versioned key: user key plus sequence number and type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A point entry as it flows through iterators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: InternalKey,
    pub value: Bytes,
}

impl Entry {
    pub fn new(key: InternalKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn user_key(&self) -> &[u8] {
        &self.key.user_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.key.sequence
    }

    pub fn value_type(&self) -> ValueType {
        self.key.value_type
    }
}

/// Deletion of every key in `[start, end)` written at `sequence`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: Bytes,
    pub end: Bytes,
    pub sequence: SequenceNumber,
}

impl RangeTombstone {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>, sequence: SequenceNumber) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            sequence,
        }
    }

    /// True if `user_key` lies in `[start, end)`
    pub fn contains(&self, user_key: &[u8]) -> bool {
        user_key >= self.start.as_ref() && user_key < self.end.as_ref()
    }
}
