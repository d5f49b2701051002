//! Deferred log lines
//!
//! Messages produced while the db mutex is held are buffered here and
//! written out through `tracing` once the lock is released.

use tracing::{debug, error, info, warn, Level};

/// Lines waiting to be logged
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<(Level, String)>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, level: Level, message: impl Into<String>) {
        self.lines.push((level, message.into()));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(Level::WARN, message);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Emit every buffered line and clear the buffer
    pub fn flush_buffer_to_log(&mut self) {
        for (level, line) in self.lines.drain(..) {
            if level == Level::ERROR {
                error!(target: "flushkv::log_buffer", "{}", line);
            } else if level == Level::WARN {
                warn!(target: "flushkv::log_buffer", "{}", line);
            } else if level == Level::INFO {
                info!(target: "flushkv::log_buffer", "{}", line);
            } else {
                debug!(target: "flushkv::log_buffer", "{}", line);
            }
        }
    }
}
