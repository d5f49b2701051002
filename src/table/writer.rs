//! Table Writer
//!
//! Writes entries in internal-key order to a new table file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::types::{Entry, InternalKey, RangeTombstone};

use super::{HEADER_SIZE, MAGIC, VERSION};

/// Result of a finished file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub path: PathBuf,
    pub file_size: u64,
    pub entry_count: u64,
    pub range_del_count: u64,
    pub index_size: u64,
    /// crc32 of every byte of the file
    pub file_crc: u32,
    pub write_nanos: u64,
    pub fsync_nanos: u64,
}

/// Buffered writer that tracks the offset and the whole-file crc
struct CountingWriter {
    inner: BufWriter<File>,
    offset: u64,
    file_hasher: crc32fast::Hasher,
}

impl CountingWriter {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.file_hasher.update(buf);
        self.offset += buf.len() as u64;
        Ok(())
    }
}

/// Writer for a single table file
///
/// Call `add()` in internal-key order, `add_range_tombstone()` at any time,
/// then `finish()` to write the remaining blocks and sync.
pub struct TableWriter {
    path: PathBuf,
    out: CountingWriter,
    entry_count: u64,
    /// Index: internal key → file offset of entry
    index: Vec<(InternalKey, u64)>,
    range_dels: Vec<RangeTombstone>,
    /// Running CRC of the data and range deletion blocks
    data_hasher: crc32fast::Hasher,
    write_nanos: u64,
    last_key: Option<InternalKey>,
}

impl TableWriter {
    /// Create the file and write its header
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut out = CountingWriter {
            inner: BufWriter::new(file),
            offset: 0,
            file_hasher: crc32fast::Hasher::new(),
        };
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        debug_assert_eq!(out.offset, HEADER_SIZE);

        Ok(Self {
            path: path.to_path_buf(),
            out,
            entry_count: 0,
            index: Vec::new(),
            range_dels: Vec::new(),
            data_hasher: crc32fast::Hasher::new(),
            write_nanos: 0,
            last_key: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Append a point entry (must be called in internal-key order)
    pub fn add(&mut self, entry: &Entry) -> io::Result<()> {
        if let Some(last) = &self.last_key {
            if &entry.key <= last {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "table entries must be added in internal-key order",
                ));
            }
        }

        let started = Instant::now();
        self.index.push((entry.key.clone(), self.out.offset));

        let key = entry.user_key();
        let mut header = [0u8; super::ENTRY_HEADER_SIZE];
        header[0..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&(entry.value.len() as u32).to_le_bytes());
        header[8..16].copy_from_slice(&entry.sequence().to_le_bytes());
        header[16] = entry.value_type().as_u8();

        self.write_data(&header)?;
        self.write_data(key)?;
        self.write_data(&entry.value)?;

        self.entry_count += 1;
        self.last_key = Some(entry.key.clone());
        self.write_nanos += started.elapsed().as_nanos() as u64;
        Ok(())
    }

    /// Queue a range tombstone for the range deletion block
    pub fn add_range_tombstone(&mut self, tombstone: &RangeTombstone) {
        self.range_dels.push(tombstone.clone());
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<()> {
        self.data_hasher.update(buf);
        self.out.write_all(buf)
    }

    /// Write the range deletion block, index, footer; then fsync
    pub fn finish(mut self) -> io::Result<WriteSummary> {
        let started = Instant::now();

        let range_del_offset = self.out.offset;
        let range_dels = std::mem::take(&mut self.range_dels);
        for t in &range_dels {
            self.write_data(&(t.start.len() as u32).to_le_bytes())?;
            self.write_data(&(t.end.len() as u32).to_le_bytes())?;
            self.write_data(&t.sequence.to_le_bytes())?;
            self.write_data(&t.start)?;
            self.write_data(&t.end)?;
        }

        // Index block: [key_len(4)][seq(8)][type(1)][offset(8)][key]
        let index_offset = self.out.offset;
        for (key, offset) in std::mem::take(&mut self.index) {
            self.out.write_all(&(key.user_key.len() as u32).to_le_bytes())?;
            self.out.write_all(&key.sequence.to_le_bytes())?;
            self.out.write_all(&[key.value_type.as_u8()])?;
            self.out.write_all(&offset.to_le_bytes())?;
            self.out.write_all(&key.user_key)?;
        }
        let index_size = self.out.offset - index_offset;

        let data_crc = self.data_hasher.clone().finalize();

        self.out.write_all(&self.entry_count.to_le_bytes())?;
        self.out.write_all(&(range_dels.len() as u64).to_le_bytes())?;
        self.out.write_all(&range_del_offset.to_le_bytes())?;
        self.out.write_all(&index_offset.to_le_bytes())?;
        self.out.write_all(&data_crc.to_le_bytes())?;
        self.out.write_all(&[0u8; 4])?; // Padding for alignment

        let file_size = self.out.offset;
        let file_crc = self.out.file_hasher.clone().finalize();

        self.out.inner.flush()?;
        self.write_nanos += started.elapsed().as_nanos() as u64;

        let file = self
            .out
            .inner
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let fsync_started = Instant::now();
        file.sync_all()?;
        let fsync_nanos = fsync_started.elapsed().as_nanos() as u64;

        Ok(WriteSummary {
            path: self.path,
            file_size,
            entry_count: self.entry_count,
            range_del_count: range_dels.len() as u64,
            index_size,
            file_crc,
            write_nanos: self.write_nanos,
            fsync_nanos,
        })
    }
}
