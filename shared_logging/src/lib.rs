#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared across engine crates.

use std::{
    collections::VecDeque,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity, ordered so records can be filtered by a minimum level.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Routine operational events.
    #[default]
    Info,
    /// Degraded but recoverable conditions.
    Warn,
    /// Failures requiring attention.
    Error,
}

/// One structured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record (e.g. `scheduler`, `feedback`).
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event name (e.g. `scheduler.subtask.dispatched`).
    pub message: String,
    /// Structured fields attached to the record.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attaches structured fields taken from a JSON object.
    #[must_use]
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = fields {
            self.fields = map;
        }
        self
    }
}

struct LoggerState {
    writer: File,
    tail: VecDeque<LogRecord>,
}

/// Append-only JSONL logger with a bounded in-memory tail for inspection.
pub struct JsonLogger {
    path: PathBuf,
    min_level: LogLevel,
    tail_capacity: usize,
    state: Mutex<LoggerState>,
}

impl std::fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLogger")
            .field("path", &self.path)
            .field("min_level", &self.min_level)
            .finish_non_exhaustive()
    }
}

impl JsonLogger {
    /// Default number of records retained in the in-memory tail.
    pub const DEFAULT_TAIL: usize = 128;

    /// Creates or opens a logger at the given path, accepting every level.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_min_level(path, LogLevel::Debug)
    }

    /// Creates or opens a logger discarding records below `min_level`.
    pub fn with_min_level(path: impl AsRef<Path>, min_level: LogLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            min_level,
            tail_capacity: Self::DEFAULT_TAIL,
            state: Mutex::new(LoggerState {
                writer,
                tail: VecDeque::with_capacity(Self::DEFAULT_TAIL),
            }),
        })
    }

    /// Appends one record as a JSON line; silently drops filtered levels.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if record.level < self.min_level {
            return Ok(());
        }
        let mut state = self.state.lock();
        serde_json::to_writer(&mut state.writer, record)?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;
        if state.tail.len() == self.tail_capacity {
            state.tail.pop_front();
        }
        state.tail.push_back(record.clone());
        Ok(())
    }

    /// Recent records retained in memory, oldest first.
    #[must_use]
    pub fn tail(&self) -> Vec<LogRecord> {
        self.state.lock().tail.iter().cloned().collect()
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines_and_tail() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("engine.log")).unwrap();
        let record = LogRecord::new("scheduler", LogLevel::Info, "scheduler.pass.completed")
            .with_fields(json!({ "dispatched": 3 }));
        logger.log(&record).unwrap();

        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("scheduler.pass.completed"));
        assert_eq!(logger.tail().len(), 1);
        assert_eq!(logger.tail()[0].fields["dispatched"], json!(3));
    }

    #[test]
    fn min_level_filters_records() {
        let dir = tempdir().unwrap();
        let logger =
            JsonLogger::with_min_level(dir.path().join("engine.log"), LogLevel::Warn).unwrap();
        logger
            .log(&LogRecord::new("registry", LogLevel::Debug, "registry.noise"))
            .unwrap();
        logger
            .log(&LogRecord::new("registry", LogLevel::Error, "registry.failed"))
            .unwrap();

        let tail = logger.tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "registry.failed");
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
