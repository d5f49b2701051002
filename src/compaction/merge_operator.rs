//! Merge operators
//!
//! A merge operator folds a chain of merge operands (optionally on top of a
//! base value) into a single value.

use bytes::{Bytes, BytesMut};

/// User-defined read-modify-write semantics
pub trait MergeOperator: Send + Sync {
    /// Fold `operands` (oldest first) onto `existing`.
    ///
    /// Returns `None` if the operands cannot be merged (treated as corruption).
    fn full_merge(&self, key: &[u8], existing: Option<&[u8]>, operands: &[Bytes]) -> Option<Bytes>;

    /// Combine operands (oldest first) without a base value. `None` means the
    /// operator cannot do this and the operands must be kept as they are.
    fn partial_merge_multi(&self, _key: &[u8], _operands: &[Bytes]) -> Option<Bytes> {
        None
    }

    fn name(&self) -> &str;
}

/// Appends operands to the existing value separated by a delimiter
#[derive(Debug, Clone)]
pub struct StringAppendOperator {
    delimiter: u8,
}

impl StringAppendOperator {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    fn join<'a>(&self, parts: impl Iterator<Item = &'a [u8]>) -> Bytes {
        let mut out = BytesMut::new();
        for (i, part) in parts.enumerate() {
            if i > 0 {
                out.extend_from_slice(&[self.delimiter]);
            }
            out.extend_from_slice(part);
        }
        out.freeze()
    }
}

impl MergeOperator for StringAppendOperator {
    fn full_merge(&self, _key: &[u8], existing: Option<&[u8]>, operands: &[Bytes]) -> Option<Bytes> {
        Some(self.join(existing.into_iter().chain(operands.iter().map(|o| o.as_ref()))))
    }

    fn partial_merge_multi(&self, _key: &[u8], operands: &[Bytes]) -> Option<Bytes> {
        Some(self.join(operands.iter().map(|o| o.as_ref())))
    }

    fn name(&self) -> &str {
        "StringAppendOperator"
    }
}
