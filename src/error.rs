//! Error types for flushkv
//!
//! A flush reports on two independent channels:
//! - the **logical status** (`Result<T>` / [`FlushError`]): aborted mempurge,
//!   unsupported filter, corruption, dropped column family, shutdown
//! - the **I/O status** ([`IoStatus`] / [`IoError`]): filesystem write, fsync
//!   and directory-sync failures
//!
//! Callers react to each differently, so they are never merged into one value.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias using FlushError
pub type Result<T> = std::result::Result<T, FlushError>;

/// Outcome of the I/O channel (`Ok(())` when no filesystem failure was seen)
pub type IoStatus = std::result::Result<(), IoError>;

/// Logical status of a flush operation
#[derive(Debug, Error)]
pub enum FlushError {
    // -------------------------------------------------------------------------
    // Recoverable / policy outcomes
    // -------------------------------------------------------------------------
    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Lifecycle Overrides
    // -------------------------------------------------------------------------
    #[error("Column family dropped: {0}")]
    ColumnFamilyDropped(String),

    #[error("Shutdown in progress: {0}")]
    ShutdownInProgress(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(IoError),
}

impl FlushError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, FlushError::Aborted(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, FlushError::NotSupported(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, FlushError::Corruption(_))
    }

    pub fn is_column_family_dropped(&self) -> bool {
        matches!(self, FlushError::ColumnFamilyDropped(_))
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        matches!(self, FlushError::ShutdownInProgress(_))
    }
}

impl From<io::Error> for FlushError {
    fn from(e: io::Error) -> Self {
        FlushError::Io(IoError::from(e))
    }
}

impl From<IoError> for FlushError {
    fn from(e: IoError) -> Self {
        FlushError::Io(e)
    }
}

/// A filesystem-level failure.
///
/// Unlike `std::io::Error` this is `Clone`, so the same failure can be kept on
/// the job's I/O channel and also surface through the logical status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoError {
    kind: io::ErrorKind,
    message: String,
}

impl IoError {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for IoError {}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<bincode::Error> for FlushError {
    fn from(e: bincode::Error) -> Self {
        FlushError::Storage(format!("Serialization error: {}", e))
    }
}
