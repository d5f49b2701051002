//! Shared helpers and collaborator fakes for the integration tests

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use flushkv::column_family::{ColumnFamilyData, DbMutex, DbState};
use flushkv::config::{ColumnFamilyOptions, Config, ConfigBuilder};
use flushkv::error::IoError;
use flushkv::flush::FlushJobBuilder;
use flushkv::memtable::{FlushState, MemTable};
use flushkv::stats::{EventSink, FlushEvent, FlushJobRecord};
use flushkv::table::{BuildOutput, BuildRequest, SstTableBuilder, TableFileBuilder, TableReader};
use flushkv::types::{Entry, ValueType};
use flushkv::version::{FileMetaData, ManifestRecord, ManifestWriter, VersionSet};
use flushkv::FlushReason;
use parking_lot::Mutex;
use tempfile::TempDir;

pub const CF: u32 = 0;

// =============================================================================
// Manifest
// =============================================================================

/// In-memory manifest that can be told to fail
#[derive(Clone, Default)]
pub struct MemManifest {
    records: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: Arc<AtomicBool>,
}

impl MemManifest {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn all_records(&self) -> Vec<ManifestRecord> {
        self.records
            .lock()
            .iter()
            .map(|r| bincode::deserialize(r).unwrap())
            .collect()
    }

    /// Records that commit version edits (file number reservations skipped)
    pub fn edit_records(&self) -> Vec<ManifestRecord> {
        self.all_records()
            .into_iter()
            .filter(|r| !r.edits.is_empty())
            .collect()
    }

    pub fn num_edit_records(&self) -> usize {
        self.edit_records().len()
    }
}

impl ManifestWriter for MemManifest {
    fn add_record(&mut self, record: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected manifest failure"));
        }
        self.records.lock().push(record.to_vec());
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Database fixture
// =============================================================================

pub struct TestDb {
    pub dir: TempDir,
    pub config: Config,
    pub db: Arc<DbMutex>,
    pub manifest: MemManifest,
}

impl TestDb {
    pub fn new(configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        Self::with_options(configure, ColumnFamilyOptions::new("default"))
    }

    pub fn with_options(
        configure: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
        options: ColumnFamilyOptions,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let config = configure(Config::builder().data_dir(dir.path())).build();
        std::fs::create_dir_all(config.data_dir.join("tables")).unwrap();

        let manifest = MemManifest::default();
        let mut state = DbState::new(VersionSet::new(Box::new(manifest.clone())));
        state.add_column_family(ColumnFamilyData::new(CF, options));

        Self {
            dir,
            config,
            db: Arc::new(DbMutex::new(state)),
            manifest,
        }
    }

    pub fn table_dir(&self) -> PathBuf {
        self.config.data_dir.join("tables")
    }

    pub fn table_path(&self, number: u64) -> PathBuf {
        flushkv::table::table_file_path(&self.table_dir(), number)
    }

    pub fn job(&self, job_id: u64) -> FlushJobBuilder {
        FlushJobBuilder::new(job_id, CF, &self.config)
    }

    /// Seal `mem` into the immutable list
    pub fn seal(&self, mem: MemTable) -> Arc<MemTable> {
        let mem = Arc::new(mem);
        self.db
            .lock()
            .cf_mut(CF)
            .unwrap()
            .imm_mut()
            .add(Arc::clone(&mem), true);
        mem
    }

    pub fn set_flush_reason(&self, reason: FlushReason) {
        self.db.lock().cf_mut(CF).unwrap().set_flush_reason(reason);
    }

    pub fn set_dropped(&self) {
        self.db.lock().cf_mut(CF).unwrap().set_dropped();
    }

    pub fn imm(&self) -> Vec<Arc<MemTable>> {
        self.db.lock().cf(CF).unwrap().imm().memtables()
    }

    pub fn state_of(&self, mem: &Arc<MemTable>) -> Option<FlushState> {
        self.db.lock().cf(CF).unwrap().imm().state_of(mem)
    }

    pub fn is_mempurge_output(&self, id: u64) -> bool {
        self.db.lock().cf(CF).unwrap().imm().is_mempurge_output(id)
    }

    pub fn level0_files(&self) -> Vec<FileMetaData> {
        self.db.lock().cf(CF).unwrap().current().files(0).to_vec()
    }

    pub fn log_number(&self) -> u64 {
        self.db.lock().cf(CF).unwrap().log_number()
    }

    /// Number of `.sst` files in the table directory
    pub fn table_files_on_disk(&self) -> usize {
        std::fs::read_dir(self.table_dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.path().extension().map_or(false, |x| x == "sst"))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Point entries of a produced table as (key, seq, type, value)
    pub fn read_table(&self, number: u64) -> Vec<(String, u64, ValueType, String)> {
        let reader = TableReader::open(&self.table_path(number)).unwrap();
        reader.entries().unwrap().iter().map(describe).collect()
    }
}

// =============================================================================
// Memtables
// =============================================================================

/// A memtable holding `entries` as (key, seq, type, value)
pub fn memtable(id: u64, entries: &[(&str, u64, ValueType, &str)]) -> MemTable {
    let mem = MemTable::new(id, 0, 64 * 1024 * 1024);
    for (key, seq, value_type, value) in entries {
        mem.add(
            *seq,
            *value_type,
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
        .unwrap();
    }
    mem
}

pub fn put(key: &'static str, seq: u64, value: &'static str) -> (&'static str, u64, ValueType, &'static str) {
    (key, seq, ValueType::Value, value)
}

pub fn del(key: &'static str, seq: u64) -> (&'static str, u64, ValueType, &'static str) {
    (key, seq, ValueType::Deletion, "")
}

pub fn merge(key: &'static str, seq: u64, operand: &'static str) -> (&'static str, u64, ValueType, &'static str) {
    (key, seq, ValueType::Merge, operand)
}

pub fn describe(e: &Entry) -> (String, u64, ValueType, String) {
    (
        String::from_utf8_lossy(e.user_key()).into_owned(),
        e.sequence(),
        e.value_type(),
        String::from_utf8_lossy(&e.value).into_owned(),
    )
}

pub fn memtable_contents(mem: &MemTable) -> Vec<(String, u64, ValueType, String)> {
    mem.entries().iter().map(describe).collect()
}

// =============================================================================
// Table builder fakes
// =============================================================================

/// Reports a filesystem failure without writing anything
pub struct FailingTableBuilder;

impl TableFileBuilder for FailingTableBuilder {
    fn build_table(&self, _request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput {
        meta.fd.file_size = 0;
        BuildOutput {
            io_status: Err(IoError::new(io::ErrorKind::Other, "injected write failure")),
            ..Default::default()
        }
    }
}

/// Delegates, then misreports the number of consumed entries
pub struct MiscountingTableBuilder {
    pub extra: u64,
}

impl TableFileBuilder for MiscountingTableBuilder {
    fn build_table(&self, request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput {
        let mut out = SstTableBuilder::new().build_table(request, meta);
        out.num_input_entries += self.extra;
        out
    }
}

/// Raises the shutdown flag while the table is being written
pub struct ShutdownDuringBuild {
    pub flag: Arc<AtomicBool>,
}

impl TableFileBuilder for ShutdownDuringBuild {
    fn build_table(&self, request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput {
        let out = SstTableBuilder::new().build_table(request, meta);
        self.flag.store(true, Ordering::Release);
        out
    }
}

/// Drops the column family while the table is being written. Takes the db
/// mutex, so it only works if the job released it.
pub struct DropDuringBuild {
    pub db: Arc<DbMutex>,
}

impl TableFileBuilder for DropDuringBuild {
    fn build_table(&self, request: BuildRequest<'_>, meta: &mut FileMetaData) -> BuildOutput {
        let out = SstTableBuilder::new().build_table(request, meta);
        self.db.lock().cf_mut(CF).unwrap().set_dropped();
        out
    }
}

// =============================================================================
// Event sink
// =============================================================================

/// Keeps every event it receives
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<FlushEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<FlushEvent> {
        self.events.lock().clone()
    }

    pub fn finished(&self) -> Vec<FlushJobRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                FlushEvent::Finished(r) => Some(r.clone()),
                FlushEvent::Started(_) => None,
            })
            .collect()
    }

    pub fn started_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, FlushEvent::Started(_)))
            .count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: FlushEvent) {
        self.events.lock().push(event);
    }
}
