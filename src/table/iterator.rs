//! Table Iterator
//!
//! Sequential iteration over the data block of a loaded table file.

use bytes::Bytes;

use crate::error::{FlushError, Result};
use crate::types::{Entry, InternalKey, ValueType};

use super::ENTRY_HEADER_SIZE;

/// Iterator over table entries in internal-key order
pub struct TableIterator {
    data: Bytes,
    /// Stop reading at this offset (start of the range deletion block)
    end_offset: usize,
    current_offset: usize,
}

impl TableIterator {
    pub(super) fn new(data: Bytes, start_offset: usize, end_offset: usize) -> Self {
        Self {
            data,
            end_offset,
            current_offset: start_offset,
        }
    }

    fn read_entry(&mut self) -> Result<Entry> {
        let pos = self.current_offset;
        let header = self
            .data
            .get(pos..pos + ENTRY_HEADER_SIZE)
            .ok_or_else(|| FlushError::Corruption(format!("truncated entry at {}", pos)))?;

        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let val_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&header[8..16]);
        let sequence = u64::from_le_bytes(seq);
        let value_type = ValueType::from_u8(header[16])
            .ok_or_else(|| FlushError::Corruption(format!("bad value type {}", header[16])))?;

        let key_start = pos + ENTRY_HEADER_SIZE;
        let val_start = key_start + key_len;
        let end = val_start + val_len;
        if end > self.end_offset {
            return Err(FlushError::Corruption(format!(
                "entry at {} runs past the data block",
                pos
            )));
        }

        self.current_offset = end;
        Ok(Entry::new(
            InternalKey::new(self.data.slice(key_start..val_start), sequence, value_type),
            self.data.slice(val_start..end),
        ))
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        // Stop at range deletion block
        if self.current_offset >= self.end_offset {
            return None;
        }

        let item = self.read_entry();
        if item.is_err() {
            // Stop after the first corrupt entry
            self.current_offset = self.end_offset;
        }
        Some(item)
    }
}
