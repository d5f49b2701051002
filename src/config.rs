//! Configuration for flushkv
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::compaction::{CompactionFilterFactory, MergeOperator};

/// Main configuration for a flushkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── MANIFEST         (version edit log)
    ///     └── tables/          (level-0 table files)
    pub data_dir: PathBuf,

    /// fsync the table directory after a level-0 file is written
    pub sync_output_directory: bool,

    /// Append flush results to the manifest (disabled for atomic flush
    /// coordinators that install results themselves)
    pub write_manifest: bool,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Nominal write buffer capacity (in bytes). Also the ceiling for a
    /// mempurge output.
    pub write_buffer_size: usize,

    /// In-memory compaction policy for buffer-full flushes
    pub mempurge_policy: MempurgePolicy,

    // -------------------------------------------------------------------------
    // Verification / Telemetry
    // -------------------------------------------------------------------------
    /// Fail the flush when the table builder consumed a different number of
    /// entries than the memtables hold
    pub flush_verify_memtable_count: bool,

    /// Attach file write/fsync timings to the completion record
    pub measure_io_stats: bool,
}

/// When a buffer-full flush may be collapsed in memory instead of written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MempurgePolicy {
    /// Never mempurge
    #[default]
    Disabled,

    /// Mempurge every eligible flush
    Always,

    /// Mempurge unless an input is itself a previous mempurge output
    Alternate,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./flushkv_data"),
            sync_output_directory: true,
            write_manifest: true,
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
            mempurge_policy: MempurgePolicy::Disabled,
            flush_verify_memtable_count: true,
            measure_io_stats: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the write buffer capacity (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the mempurge policy
    pub fn mempurge_policy(mut self, policy: MempurgePolicy) -> Self {
        self.config.mempurge_policy = policy;
        self
    }

    /// Treat entry-count mismatches after a flush as corruption
    pub fn flush_verify_memtable_count(mut self, verify: bool) -> Self {
        self.config.flush_verify_memtable_count = verify;
        self
    }

    /// Sync the output directory after writing a table
    pub fn sync_output_directory(mut self, sync: bool) -> Self {
        self.config.sync_output_directory = sync;
        self
    }

    /// Install flush results into the manifest
    pub fn write_manifest(mut self, write: bool) -> Self {
        self.config.write_manifest = write;
        self
    }

    /// Record I/O timings for each flush
    pub fn measure_io_stats(mut self, measure: bool) -> Self {
        self.config.measure_io_stats = measure;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Per-column-family options
#[derive(Clone, Default)]
pub struct ColumnFamilyOptions {
    /// Human readable column family name
    pub name: String,

    /// Combines merge operands during flush
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Creates the filter applied to flush output
    pub compaction_filter_factory: Option<Arc<dyn CompactionFilterFactory>>,
}

impl ColumnFamilyOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(op);
        self
    }

    pub fn with_compaction_filter_factory(
        mut self,
        factory: Arc<dyn CompactionFilterFactory>,
    ) -> Self {
        self.compaction_filter_factory = Some(factory);
        self
    }
}

impl fmt::Debug for ColumnFamilyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamilyOptions")
            .field("name", &self.name)
            .field(
                "merge_operator",
                &self.merge_operator.as_ref().map(|m| m.name()),
            )
            .field(
                "compaction_filter_factory",
                &self.compaction_filter_factory.as_ref().map(|f| f.name()),
            )
            .finish()
    }
}
