//! Column family state and the shared db mutex
//!
//! Everything a flush job mutates lives inside [`DbState`], which is guarded
//! by one `parking_lot::Mutex`. Holding `&mut DbState` (usually through a
//! `MutexGuard`) is the "lock held" precondition of every job entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ColumnFamilyOptions;
use crate::flush::FlushReason;
use crate::memtable::{InstallOutcome, MemTable, MemTableList};
use crate::stats::InternalStats;
use crate::version::{Version, VersionSet};

/// The single shared db mutex
pub type DbMutex = Mutex<DbState>;

/// Per-column-family metadata
pub struct ColumnFamilyData {
    id: u32,
    options: Arc<ColumnFamilyOptions>,
    imm: MemTableList,
    current: Arc<Version>,
    dropped: bool,
    flush_reason: FlushReason,
    log_number: u64,
    internal_stats: InternalStats,
}

impl ColumnFamilyData {
    pub fn new(id: u32, options: ColumnFamilyOptions) -> Self {
        Self {
            id,
            options: Arc::new(options),
            imm: MemTableList::new(),
            current: Arc::new(Version::empty()),
            dropped: false,
            flush_reason: FlushReason::Others,
            log_number: 0,
            internal_stats: InternalStats::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &Arc<ColumnFamilyOptions> {
        &self.options
    }

    pub fn imm(&self) -> &MemTableList {
        &self.imm
    }

    pub fn imm_mut(&mut self) -> &mut MemTableList {
        &mut self.imm
    }

    /// The current on-disk version (clone the `Arc` to pin it)
    pub fn current(&self) -> &Arc<Version> {
        &self.current
    }

    pub(crate) fn install_version(&mut self, version: Arc<Version>) {
        self.current = version;
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub fn set_dropped(&mut self) {
        self.dropped = true;
    }

    pub fn flush_reason(&self) -> FlushReason {
        self.flush_reason
    }

    pub fn set_flush_reason(&mut self, reason: FlushReason) {
        self.flush_reason = reason;
    }

    /// Logs below this number are not needed to recover this column family
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub(crate) fn set_log_number(&mut self, num: u64) {
        self.log_number = self.log_number.max(num);
    }

    pub fn internal_stats(&self) -> &InternalStats {
        &self.internal_stats
    }

    pub fn internal_stats_mut(&mut self) -> &mut InternalStats {
        &mut self.internal_stats
    }
}

/// All state protected by the shared db mutex
pub struct DbState {
    pub versions: VersionSet,
    column_families: BTreeMap<u32, ColumnFamilyData>,
}

impl DbState {
    pub fn new(versions: VersionSet) -> Self {
        Self {
            versions,
            column_families: BTreeMap::new(),
        }
    }

    pub fn add_column_family(&mut self, cfd: ColumnFamilyData) {
        self.column_families.insert(cfd.id(), cfd);
    }

    pub fn cf(&self, id: u32) -> Option<&ColumnFamilyData> {
        self.column_families.get(&id)
    }

    pub fn cf_mut(&mut self, id: u32) -> Option<&mut ColumnFamilyData> {
        self.column_families.get_mut(&id)
    }

    pub fn column_family_ids(&self) -> Vec<u32> {
        self.column_families.keys().copied().collect()
    }

    /// Disjoint borrows of the version set and one column family
    pub fn split_mut(&mut self, id: u32) -> Option<(&mut VersionSet, &mut ColumnFamilyData)> {
        let cfd = self.column_families.get_mut(&id)?;
        Some((&mut self.versions, cfd))
    }

    /// Install the results of a finished flush of column family `cf_id`.
    ///
    /// Committed edits go to the manifest through the version set; the new
    /// version and log floor are installed on success.
    pub fn try_install_memtable_flush_results(
        &mut self,
        cf_id: u32,
        mems: &[Arc<MemTable>],
        file_number: u64,
        write_edit: bool,
    ) -> InstallOutcome {
        let versions = &mut self.versions;
        let Some(cfd) = self.column_families.get_mut(&cf_id) else {
            return InstallOutcome::default();
        };
        let ColumnFamilyData {
            imm,
            current,
            log_number,
            ..
        } = cfd;

        imm.try_install_memtable_flush_results(mems, file_number, write_edit, |edits| {
            let next = versions.log_and_apply(&**current, edits)?;
            *current = Arc::new(next);
            for edit in edits {
                if let Some(n) = edit.log_number() {
                    *log_number = (*log_number).max(n);
                }
            }
            Ok(())
        })
    }
}
