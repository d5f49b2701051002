//! Table Reader
//!
//! Loads a table file, verifies its checksums and serves lookups through an
//! in-memory index.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bytes::Bytes;

use crate::error::{FlushError, Result};
use crate::types::{Entry, InternalKey, RangeTombstone, SequenceNumber, ValueType};

use super::iterator::TableIterator;
use super::{FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| FlushError::Corruption(format!("truncated u32 at {}", pos)))
}

fn read_u64(buf: &[u8], pos: usize) -> Result<u64> {
    let b = buf
        .get(pos..pos + 8)
        .ok_or_else(|| FlushError::Corruption(format!("truncated u64 at {}", pos)))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    Ok(u64::from_le_bytes(arr))
}

/// Reader for table files with an in-memory index
pub struct TableReader {
    data: Bytes,
    /// In-memory index: internal key → entry offset
    index: BTreeMap<InternalKey, usize>,
    range_dels: Vec<RangeTombstone>,
    entry_count: u64,
    range_del_offset: usize,
}

impl TableReader {
    /// Open a table file, verifying magic, version and data checksum
    pub fn open(path: &Path) -> Result<Self> {
        let data = Bytes::from(fs::read(path)?);
        let len = data.len();

        if (len as u64) < HEADER_SIZE + FOOTER_SIZE {
            return Err(FlushError::Corruption(format!(
                "table file too small: {} bytes",
                len
            )));
        }

        if &data[0..4] != MAGIC {
            return Err(FlushError::Storage(format!(
                "Invalid table magic: expected FKVT, got {:?}",
                &data[0..4]
            )));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(FlushError::Storage(format!(
                "Unsupported table version: {}",
                version
            )));
        }

        let footer = len - FOOTER_SIZE as usize;
        let entry_count = read_u64(&data, footer)?;
        let range_del_count = read_u64(&data, footer + 8)?;
        let range_del_offset = read_u64(&data, footer + 16)? as usize;
        let index_offset = read_u64(&data, footer + 24)? as usize;
        let stored_crc = read_u32(&data, footer + 32)?;

        if !(HEADER_SIZE as usize <= range_del_offset
            && range_del_offset <= index_offset
            && index_offset <= footer)
        {
            return Err(FlushError::Corruption("table footer offsets out of range".to_string()));
        }

        let actual_crc = crc32fast::hash(&data[HEADER_SIZE as usize..index_offset]);
        if actual_crc != stored_crc {
            return Err(FlushError::Corruption(format!(
                "table data checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        // Range deletion block: [start_len(4)][end_len(4)][seq(8)][start][end]
        let mut range_dels = Vec::with_capacity(range_del_count as usize);
        let mut pos = range_del_offset;
        for _ in 0..range_del_count {
            let start_len = read_u32(&data, pos)? as usize;
            let end_len = read_u32(&data, pos + 4)? as usize;
            let sequence = read_u64(&data, pos + 8)?;
            let start = pos + 16;
            let end = start + start_len;
            if end + end_len > index_offset {
                return Err(FlushError::Corruption("range deletion block truncated".to_string()));
            }
            range_dels.push(RangeTombstone::new(
                data.slice(start..end),
                data.slice(end..end + end_len),
                sequence,
            ));
            pos = end + end_len;
        }

        // Index block: [key_len(4)][seq(8)][type(1)][offset(8)][key]
        let mut index = BTreeMap::new();
        let mut pos = index_offset;
        while pos < footer {
            let key_len = read_u32(&data, pos)? as usize;
            let sequence = read_u64(&data, pos + 4)?;
            let value_type = data
                .get(pos + 12)
                .and_then(|&b| ValueType::from_u8(b))
                .ok_or_else(|| FlushError::Corruption("bad value type in index".to_string()))?;
            let offset = read_u64(&data, pos + 13)? as usize;
            let key_start = pos + 21;
            if key_start + key_len > footer {
                return Err(FlushError::Corruption("index block truncated".to_string()));
            }
            let key = InternalKey::new(data.slice(key_start..key_start + key_len), sequence, value_type);
            index.insert(key, offset);
            pos = key_start + key_len;
        }

        if index.len() as u64 != entry_count {
            return Err(FlushError::Corruption(format!(
                "index has {} keys, footer says {}",
                index.len(),
                entry_count
            )));
        }

        Ok(Self {
            data,
            index,
            range_dels,
            entry_count,
            range_del_offset,
        })
    }

    /// Newest version of `user_key` visible at `snapshot`, ignoring range
    /// tombstones
    pub fn get(&self, user_key: &[u8], snapshot: SequenceNumber) -> Result<Option<Entry>> {
        let seek = InternalKey::new(Bytes::copy_from_slice(user_key), snapshot, ValueType::Merge);
        let offset = match self.index.range(seek..).next() {
            Some((k, &off)) if k.user_key.as_ref() == user_key => off,
            _ => return Ok(None),
        };

        let mut iter = TableIterator::new(self.data.clone(), offset, self.range_del_offset);
        iter.next().transpose()
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn range_tombstones(&self) -> &[RangeTombstone] {
        &self.range_dels
    }

    /// crc32 of the whole file, as recorded in the manifest
    pub fn file_checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    /// Smallest internal key
    pub fn smallest_key(&self) -> Option<&InternalKey> {
        self.index.keys().next()
    }

    /// Largest internal key
    pub fn largest_key(&self) -> Option<&InternalKey> {
        self.index.keys().next_back()
    }

    /// Iterate over all point entries
    pub fn iter(&self) -> TableIterator {
        TableIterator::new(self.data.clone(), HEADER_SIZE as usize, self.range_del_offset)
    }

    /// Collect all point entries
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.iter().collect()
    }
}
