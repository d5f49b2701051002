//! # flushkv
//!
//! The memtable flush job of an LSM key-value store:
//! - Level-0 table writes with snapshot-aware garbage collection
//! - Mempurge: in-memory compaction of sealed memtables
//! - Ordered, transactional installation of results into the manifest
//! - Structured flush events and per-level accounting
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │        (active memtables, snapshots, flush requests)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ switch_memtable / flush
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │               DbState (shared db mutex)                      │
//! │   VersionSet + ColumnFamilyData { MemTableList, Version }    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ pick / run / install
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Mempurge   │          │  Level-0    │
//!   │ (MemTable)  │          │   table     │
//!   └──────┬──────┘          └──────┬──────┘
//!          └──────────┬─────────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │ CompactionIter  │
//!            │ (GC engine)     │
//!            └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod version;
pub mod memtable;
pub mod compaction;
pub mod table;
pub mod stats;
pub mod flush;
pub mod column_family;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use column_family::{ColumnFamilyData, DbMutex, DbState};
pub use config::{ColumnFamilyOptions, Config, MempurgePolicy};
pub use engine::{Engine, DEFAULT_COLUMN_FAMILY};
pub use error::{FlushError, IoError, IoStatus, Result};
pub use flush::{FlushJob, FlushJobBuilder, FlushJobInfo, FlushOutcome, FlushReason};
pub use types::{Entry, InternalKey, RangeTombstone, SequenceNumber, ValueType};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of flushkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
