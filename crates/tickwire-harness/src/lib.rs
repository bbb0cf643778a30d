//! Supervised execution of automation routines.
//!
//! A routine is an async closure driving the simulation through a
//! [`RoutineContext`]. The [`Harness`] runs it as its own task, records every
//! action call with the state change around it, and stops it when the
//! session disconnects, the simulation stops ticking, the routine stalls,
//! or the time limit expires. Every run ends in exactly one [`RunRecord`].
//!
//! # Modules
//!
//! - [`harness`] -- Run loop, abort signalling, [`RoutineContext`]
//! - [`instrument`] -- [`Instrumented`] call-recording decorator
//! - [`monitor`] -- Stall and tick-freeze detection
//! - [`delta`] -- Structural diff between two snapshots
//! - [`console`] -- Deduplicated console capture
//! - [`record`] -- Run record accumulation and outcomes
//! - [`sink`] -- Persistence of finished records
//! - [`config`] -- Harness configuration
//! - [`error`] -- Abort reasons and routine errors

pub mod config;
pub mod console;
pub mod delta;
pub mod error;
pub mod harness;
pub mod instrument;
pub mod monitor;
pub mod record;
pub mod sink;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{ConfigError, HarnessConfig};
pub use console::{ConsoleCapture, ConsoleEntry, ConsoleLevel};
pub use delta::{DeltaConfig, StateDelta};
pub use error::{AbortReason, DisconnectCause, RoutineError, SinkError};
pub use harness::{Harness, RoutineContext, ScreenshotSource};
pub use instrument::Instrumented;
pub use monitor::{ProgressMonitor, StallSignal, TickFrozen, TickMonitor};
pub use record::{
    ActionCall, CallOutcome, Diagnostics, RunOutcome, RunRecord, RunRecorder, ScreenshotEntry,
    SnapshotEntry,
};
pub use sink::{JsonlSink, MemorySink, RunSink};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
