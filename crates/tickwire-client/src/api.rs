//! The capability a routine drives the simulation through.
//!
//! Routines are written against [`ActionApi`] rather than [`Session`] so
//! that wrappers (such as the harness's instrumenting decorator) and test
//! doubles can stand in for a live session.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tickwire_types::{Action, WorldSnapshot};

use crate::error::ActionError;
use crate::session::Session;

/// Submit actions and read the latest observed state.
pub trait ActionApi: Send + Sync {
    /// Submit one action and wait for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] when the action is not acknowledged; see
    /// [`ActionError::effect`] for what that implies about the world.
    fn submit(&self, action: Action) -> impl Future<Output = Result<Value, ActionError>> + Send;

    /// The most recent snapshot, if any.
    fn snapshot(&self) -> Option<Arc<WorldSnapshot>>;
}

impl ActionApi for Session {
    fn submit(&self, action: Action) -> impl Future<Output = Result<Value, ActionError>> + Send {
        Self::submit(self, action)
    }

    fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
        self.latest()
    }
}

impl<A: ActionApi> ActionApi for Arc<A> {
    fn submit(&self, action: Action) -> impl Future<Output = Result<Value, ActionError>> + Send {
        A::submit(self, action)
    }

    fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
        A::snapshot(self)
    }
}
