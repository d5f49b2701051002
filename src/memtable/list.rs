//! Immutable MemTable list
//!
//! Sealed memtables of one column family, oldest first, with their flush
//! state. Mutated only under the shared db mutex.
//!
//! ## Lifecycle of an entry
//! ```text
//!   Pending ──pick──▶ InProgress ──job ok──▶ Completed ──commit──▶ (removed)
//!      ▲                  │                      │
//!      └────rollback──────┘◀──manifest failure───┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::IoStatus;
use crate::flush::FlushJobInfo;
use crate::version::VersionEdit;

use super::MemTable;

/// Flush state of one sealed memtable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Waiting to be picked by a flush job
    Pending,

    /// Picked by a running job
    InProgress,

    /// Job finished; waiting for older memtables before being committed
    Completed { file_number: u64 },
}

struct ImmEntry {
    mem: Arc<MemTable>,
    state: FlushState,
}

/// Result of an install attempt
#[derive(Debug)]
pub struct InstallOutcome {
    /// Manifest write status (the only channel install failures use)
    pub io_status: IoStatus,

    /// Memtables removed from the list; freed once the last `Arc` drops
    pub memtables_to_free: Vec<Arc<MemTable>>,

    /// Infos of the flush jobs whose results were committed
    pub committed_flush_jobs: Vec<FlushJobInfo>,
}

impl Default for InstallOutcome {
    fn default() -> Self {
        Self {
            io_status: Ok(()),
            memtables_to_free: Vec::new(),
            committed_flush_jobs: Vec::new(),
        }
    }
}

/// Ordered list of sealed memtables awaiting flush
pub struct MemTableList {
    memlist: Vec<ImmEntry>,
    /// Ids of memtables produced by a mempurge
    mempurge_outputs: HashSet<u64>,
    flush_requested: bool,
}

impl MemTableList {
    pub fn new() -> Self {
        Self {
            memlist: Vec::new(),
            mempurge_outputs: HashSet::new(),
            flush_requested: false,
        }
    }

    /// Add a sealed memtable, keeping id order.
    ///
    /// `request_flush = false` is used for mempurge outputs: the substitution
    /// does not create new data, so it does not by itself call for a flush.
    pub fn add(&mut self, mem: Arc<MemTable>, request_flush: bool) {
        let pos = self
            .memlist
            .iter()
            .position(|e| e.mem.id() > mem.id())
            .unwrap_or(self.memlist.len());
        self.memlist.insert(
            pos,
            ImmEntry {
                mem,
                state: FlushState::Pending,
            },
        );
        if request_flush {
            self.flush_requested = true;
        }
    }

    pub fn len(&self) -> usize {
        self.memlist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memlist.is_empty()
    }

    /// Sealed memtables whose data has not yet been committed
    pub fn num_not_flushed(&self) -> usize {
        self.memlist.len()
    }

    /// Sealed memtables no job has picked
    pub fn num_flush_not_started(&self) -> usize {
        self.memlist
            .iter()
            .filter(|e| e.state == FlushState::Pending)
            .count()
    }

    /// True if a flush was requested and something is pickable
    pub fn is_flush_pending(&self) -> bool {
        self.flush_requested && self.num_flush_not_started() > 0
    }

    /// All memtables, oldest first
    pub fn memtables(&self) -> Vec<Arc<MemTable>> {
        self.memlist.iter().map(|e| Arc::clone(&e.mem)).collect()
    }

    /// Id of the newest memtable, if any
    pub fn latest_id(&self) -> Option<u64> {
        self.memlist.last().map(|e| e.mem.id())
    }

    /// Flush state of a memtable, located by identity
    pub fn state_of(&self, mem: &Arc<MemTable>) -> Option<FlushState> {
        self.find(mem).map(|i| self.memlist[i].state)
    }

    /// True if `mems` are exactly the oldest entries of the list
    pub fn starts_with(&self, mems: &[Arc<MemTable>]) -> bool {
        mems.len() <= self.memlist.len()
            && mems
                .iter()
                .zip(&self.memlist)
                .all(|(m, e)| Arc::ptr_eq(m, &e.mem))
    }

    fn find(&self, mem: &Arc<MemTable>) -> Option<usize> {
        self.memlist.iter().position(|e| Arc::ptr_eq(&e.mem, mem))
    }

    // =========================================================================
    // Flush bookkeeping
    // =========================================================================

    /// Select every pending memtable with id <= `max_memtable_id`, oldest
    /// first, and mark them in progress.
    pub fn pick_memtables_to_flush(&mut self, max_memtable_id: u64) -> Vec<Arc<MemTable>> {
        let mut picked = Vec::new();
        for entry in self.memlist.iter_mut() {
            if entry.mem.id() > max_memtable_id {
                break;
            }
            if entry.state == FlushState::Pending {
                entry.state = FlushState::InProgress;
                picked.push(Arc::clone(&entry.mem));
            }
        }
        self.flush_requested = false;
        picked
    }

    /// Return picked memtables to the pending state after a failed flush.
    /// `file_number` is abandoned and never reused.
    pub fn rollback_memtable_flush(&mut self, mems: &[Arc<MemTable>], file_number: u64) {
        for mem in mems {
            match self.find(mem) {
                Some(i) => {
                    debug_assert_eq!(self.memlist[i].state, FlushState::InProgress);
                    self.memlist[i].state = FlushState::Pending;
                    mem.edit().clear();
                }
                None => warn!(memtable = mem.id(), "rollback of memtable not in list"),
            }
        }
        self.flush_requested = true;
        debug!(
            memtables = mems.len(),
            abandoned_file = file_number,
            "rolled back memtable flush"
        );
    }

    /// Mark `mems` completed and commit every leading run of completed
    /// memtables, oldest first.
    ///
    /// `apply` persists a batch of edits (the manifest write). When it fails
    /// the batch returns to pending and the failure is reported on
    /// [`InstallOutcome::io_status`] only. With `write_edit = false` (mempurge
    /// succeeded) `mems` are removed at once, without a manifest record.
    pub fn try_install_memtable_flush_results<F>(
        &mut self,
        mems: &[Arc<MemTable>],
        file_number: u64,
        write_edit: bool,
        mut apply: F,
    ) -> InstallOutcome
    where
        F: FnMut(&[VersionEdit]) -> IoStatus,
    {
        let mut outcome = InstallOutcome::default();

        for mem in mems {
            let Some(i) = self.find(mem) else {
                warn!(memtable = mem.id(), "install of memtable not in list");
                continue;
            };
            if write_edit {
                self.memlist[i].state = FlushState::Completed { file_number };
            } else {
                // Nothing goes to the manifest, so there is no log floor to
                // keep in order: drop the memtable right away
                let entry = self.memlist.remove(i);
                if let Some(info) = entry.mem.take_flush_job_info() {
                    outcome.committed_flush_jobs.push(info);
                }
                outcome.memtables_to_free.push(entry.mem);
            }
        }

        loop {
            let batch_len = self
                .memlist
                .iter()
                .take_while(|e| matches!(e.state, FlushState::Completed { .. }))
                .count();
            if batch_len == 0 {
                break;
            }

            // One edit per job: the first (oldest) memtable of each file
            let mut edits = Vec::new();
            let mut last_file_number = None;
            for entry in &self.memlist[..batch_len] {
                if let FlushState::Completed { file_number } = entry.state {
                    if last_file_number != Some(file_number) {
                        edits.push(entry.mem.edit().clone());
                        last_file_number = Some(file_number);
                    }
                }
            }

            if !edits.is_empty() {
                if let Err(e) = apply(&edits) {
                    warn!(error = %e, memtables = batch_len, "manifest write failed, restoring memtables");
                    for entry in &mut self.memlist[..batch_len] {
                        entry.state = FlushState::Pending;
                        entry.mem.edit().clear();
                    }
                    self.flush_requested = true;
                    outcome.io_status = Err(e);
                    break;
                }
            }

            for entry in self.memlist.drain(..batch_len) {
                self.mempurge_outputs.remove(&entry.mem.id());
                if let Some(info) = entry.mem.take_flush_job_info() {
                    outcome.committed_flush_jobs.push(info);
                }
                outcome.memtables_to_free.push(entry.mem);
            }
        }

        outcome
    }

    // =========================================================================
    // Mempurge output tags
    // =========================================================================

    pub fn add_mempurge_output_id(&mut self, id: u64) {
        self.mempurge_outputs.insert(id);
    }

    pub fn remove_mempurge_output_id(&mut self, id: u64) {
        self.mempurge_outputs.remove(&id);
    }

    pub fn is_mempurge_output(&self, id: u64) -> bool {
        self.mempurge_outputs.contains(&id)
    }

    /// Take a mempurge output back out of the list along with its tag.
    /// Returns false if `mem` is not in the list.
    pub fn remove_mempurge_output(&mut self, mem: &Arc<MemTable>) -> bool {
        let Some(i) = self.find(mem) else {
            return false;
        };
        debug_assert_eq!(self.memlist[i].state, FlushState::Pending);
        self.memlist.remove(i);
        self.mempurge_outputs.remove(&mem.id());
        debug!(memtable = mem.id(), "removed mempurge output");
        true
    }
}

impl Default for MemTableList {
    fn default() -> Self {
        Self::new()
    }
}
