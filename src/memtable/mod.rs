//! MemTable Module
//!
//! In-memory write buffers and the list of sealed buffers awaiting flush.
//!
//! ## Responsibilities
//! - Ordered storage of versioned point entries and range tombstones
//! - Size/count accounting consumed by the flush job
//! - The immutable list: flush state per sealed memtable, mempurge-output
//!   tags, pick / rollback / install bookkeeping
//!
//! ## Data Structure Choice
//! A `BTreeMap<InternalKey, Bytes>` behind a `parking_lot::RwLock`. Iteration
//! hands out a cloned, ordered snapshot (cheap: keys and values are `Bytes`),
//! so iterators outlive any lock and the flush job can merge without holding
//! the db mutex. Memtables are shared through `Arc` and freed when the last
//! reference goes away.

mod list;
mod table;

pub use list::{FlushState, InstallOutcome, MemTableList};
pub use table::{MemTable, ENTRY_OVERHEAD};
