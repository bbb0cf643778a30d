//! Destinations for finished run records.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::SinkError;
use crate::lock;
use crate::record::RunRecord;

/// Somewhere a finished [`RunRecord`] is persisted.
///
/// The harness calls `append` on tokio's blocking pool, so implementations
/// may do synchronous I/O.
pub trait RunSink: Send + Sync {
    /// Persist one record.
    fn append(&self, record: &RunRecord) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a file, creating it if needed.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    /// The file records are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunSink for JsonlSink {
    fn append(&self, record: &RunRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = lock(&self.write);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!(path = %self.path.display(), run_id = %record.run_id, "run record appended");
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and embedders that ship records
/// elsewhere themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RunRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far.
    pub fn records(&self) -> Vec<RunRecord> {
        lock(&self.records).clone()
    }
}

impl RunSink for MemorySink {
    fn append(&self, record: &RunRecord) -> Result<(), SinkError> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
