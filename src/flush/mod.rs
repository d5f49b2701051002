//! Flush Module
//!
//! Turns sealed memtables of one column family into a level-0 table file,
//! or collapses them in memory (mempurge) when the policy allows it.
//!
//! ## Job lifecycle
//! ```text
//! FlushJobBuilder::build()
//!        │
//!        ▼
//! pick_memtable()  ── nothing picked ──▶ run() is a no-op
//!        │
//!        ▼
//!      run()
//!        ├─ mempurge (buffer-full flush, policy allows) ──┐
//!        │        aborted / failed                        │ ok
//!        ▼                                                 │
//!  write_level0_table()                                    │
//!        ├───────────────────────┬─────────────────────────┘
//!        ▼                       ▼
//!    rollback                 install
//!        └──────────┬────────────┘
//!                   ▼
//!         flush_finished event
//! ```
//!
//! Every entry point takes the db state with the shared lock held. The
//! disk write and the in-memory merge run with the lock released.

mod job;
mod log_buffer;
mod mempurge;

use std::fmt;
use std::path::PathBuf;

use crate::error::{IoStatus, Result};
use crate::table::TableProperties;
use crate::types::SequenceNumber;
use crate::version::FileMetaData;

pub use job::{FlushJob, FlushJobBuilder};
pub use log_buffer::LogBuffer;

/// Why a flush was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlushReason {
    #[default]
    Others,
    GetLiveFiles,
    ShutDown,
    ExternalFileIngestion,
    ManualCompaction,
    WriteBufferManager,
    /// The only reason under which a mempurge may be attempted
    WriteBufferFull,
    Test,
    DeleteFiles,
    AutoCompaction,
    ManualFlush,
    ErrorRecovery,
    ErrorRecoveryRetryFlush,
    WalFull,
}

impl FlushReason {
    /// Human readable name, as logged in flush events
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Others => "Other Reasons",
            FlushReason::GetLiveFiles => "Get Live Files",
            FlushReason::ShutDown => "Shut down",
            FlushReason::ExternalFileIngestion => "External File Ingestion",
            FlushReason::ManualCompaction => "Manual Compaction",
            FlushReason::WriteBufferManager => "Write Buffer Manager",
            FlushReason::WriteBufferFull => "Write Buffer Full",
            FlushReason::Test => "Test",
            FlushReason::DeleteFiles => "Delete Files",
            FlushReason::AutoCompaction => "Auto Compaction",
            FlushReason::ManualFlush => "Manual Flush",
            FlushReason::ErrorRecovery => "Error Recovery",
            FlushReason::ErrorRecoveryRetryFlush => "Error Recovery Retry Flush",
            FlushReason::WalFull => "WAL Full",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of a flush job, attached to the oldest flushed memtable and
/// handed back once its results are committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushJobInfo {
    pub cf_id: u32,
    pub cf_name: String,
    pub file_path: PathBuf,
    pub file_number: u64,
    pub oldest_blob_file_number: u64,
    pub thread_id: String,
    pub job_id: u64,
    pub smallest_seqno: SequenceNumber,
    pub largest_seqno: SequenceNumber,
    pub table_properties: TableProperties,
    pub flush_reason: FlushReason,
}

/// Result of [`FlushJob::run`]
///
/// The two channels are independent: a flush can succeed logically while a
/// manifest write failed (`io_status` is `Err`), and callers decide what to
/// do with each.
#[derive(Debug)]
pub struct FlushOutcome {
    pub status: Result<()>,
    pub io_status: IoStatus,
    /// Metadata of the produced file, set only when `status` is ok
    pub file_meta: Option<FileMetaData>,
}

impl FlushOutcome {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok() && self.io_status.is_ok()
    }

    /// The produced file, if one was registered
    pub fn output_file(&self) -> Option<&FileMetaData> {
        self.file_meta.as_ref().filter(|m| m.file_size() > 0)
    }
}
