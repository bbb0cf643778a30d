//! Deduplicated console capture for routines.
//!
//! Routines tend to log the same line in a polling loop. Consecutive
//! identical lines (same level and text) collapse into one entry whose
//! `repeat` count grows. Every line is also mirrored to `tracing` under the
//! `routine` target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Severity of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    /// Informational output.
    Info,
    /// Something the routine considers suspicious.
    Warn,
}

/// One captured line, possibly repeated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// When the line was first logged.
    pub at: DateTime<Utc>,
    /// When the last repeat was logged.
    pub last_at: DateTime<Utc>,
    /// Simulation tick at first logging, if known.
    pub tick: Option<u64>,
    /// Severity.
    pub level: ConsoleLevel,
    /// The text.
    pub line: String,
    /// How many consecutive times the line was logged (at least 1).
    pub repeat: u32,
}

/// Append-only console buffer with consecutive-duplicate collapsing.
#[derive(Debug, Clone, Default)]
pub struct ConsoleCapture {
    entries: Vec<ConsoleEntry>,
}

impl ConsoleCapture {
    /// Create an empty capture.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Capture a line.
    pub fn push(&mut self, level: ConsoleLevel, line: &str, tick: Option<u64>) {
        match level {
            ConsoleLevel::Info => info!(target: "routine", tick, "{line}"),
            ConsoleLevel::Warn => warn!(target: "routine", tick, "{line}"),
        }

        let now = Utc::now();
        if let Some(last) = self
            .entries
            .last_mut()
            .filter(|last| last.level == level && last.line == line)
        {
            last.repeat = last.repeat.saturating_add(1);
            last.last_at = now;
            return;
        }
        self.entries.push(ConsoleEntry {
            at: now,
            last_at: now,
            tick,
            level,
            line: line.to_owned(),
            repeat: 1,
        });
    }

    /// Captured entries, oldest first.
    pub fn entries(&self) -> &[ConsoleEntry] {
        &self.entries
    }

    /// Take the captured entries, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<ConsoleEntry> {
        std::mem::take(&mut self.entries)
    }
}
