//! Manifest log
//!
//! Append-only history of version edits. Each `log_and_apply` call becomes
//! one record holding the batch of edits it committed.
//!
//! ## Record Format
//! ```text
//! ┌─────────┬─────────┬──────────────────────────┐
//! │ Len (4) │ CRC (4) │ bincode(ManifestRecord)  │
//! └─────────┴─────────┴──────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlushError, Result};

use super::VersionEdit;

/// Record header: Len (4) + CRC (4)
pub const RECORD_HEADER_SIZE: usize = 8;

/// One committed batch of edits
///
/// A record with no edits only reserves file numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub edits: Vec<VersionEdit>,
    /// Every file number below this one may have been handed out
    pub next_file_number: u64,
}

impl ManifestRecord {
    pub fn new(edits: Vec<VersionEdit>, next_file_number: u64) -> Self {
        Self {
            edits,
            next_file_number,
        }
    }
}

/// Destination for serialized manifest records
///
/// Persistent version history is owned elsewhere; the flush path only needs
/// to append a record and make it durable.
pub trait ManifestWriter: Send {
    fn add_record(&mut self, record: &[u8]) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

/// File-backed manifest
pub struct ManifestLog {
    path: PathBuf,
    file: File,
}

impl ManifestLog {
    /// Open (or create) a manifest for appending
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every intact record. A torn trailing record is ignored.
    pub fn read_records(path: &Path) -> Result<Vec<ManifestRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();

        loop {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if crc32fast::hash(&payload) != crc {
                return Err(FlushError::Corruption(format!(
                    "manifest record {} checksum mismatch",
                    records.len()
                )));
            }

            records.push(bincode::deserialize(&payload)?);
        }

        Ok(records)
    }
}

impl ManifestWriter for ManifestLog {
    fn add_record(&mut self, record: &[u8]) -> io::Result<()> {
        let len = record.len() as u32;
        let crc = crc32fast::hash(record);

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + record.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(record);
        self.file.write_all(&buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}
