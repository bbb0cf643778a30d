//! Session client for a tick-based remote simulation.
//!
//! A [`Session`] owns one WebSocket to the simulation. It correlates
//! fire-and-forget commands with their acknowledgements, keeps the latest
//! pushed [`WorldSnapshot`](tickwire_types::WorldSnapshot) in a
//! [`StateCache`], and reconnects with exponential backoff when the socket
//! drops without being asked to.
//!
//! # Modules
//!
//! - [`config`] -- YAML client configuration with environment overrides
//! - [`correlator`] -- Pending command table keyed by correlation id
//! - [`state_cache`] -- Latest snapshot, listener fan-out, `wait_until`
//! - [`reconnect`] -- Connection state machine and backoff schedule
//! - [`session`] -- Connect, submit, disconnect, and the reconnect loop
//! - [`registry`] -- Named sessions with an owned lifecycle
//! - [`api`] -- The [`ActionApi`] capability implemented by sessions
//! - [`error`] -- Client, action, and wait errors

pub mod api;
pub mod config;
pub mod correlator;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod state_cache;
mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use api::ActionApi;
pub use config::{ClientConfig, ConfigError};
pub use correlator::{Correlator, PendingReceipt, Settlement};
pub use error::{ActionError, ClientError, EffectKnowledge, WaitError};
pub use reconnect::{Backoff, ConnectionEvent, ConnectionMachine, InvalidTransition};
pub use registry::SessionRegistry;
pub use session::Session;
pub use state_cache::{ListenerId, SnapshotListener, StateCache};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate is short and leaves the data
/// consistent, so a poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
