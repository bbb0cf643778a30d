//! Named sessions with an owned lifecycle.
//!
//! A [`SessionRegistry`] is created by the caller and passed to whoever
//! needs sessions; there is no process-wide session map.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::lock;
use crate::session::Session;

/// Sessions keyed by name.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a disconnected session under `name`.
    ///
    /// # Errors
    ///
    /// [`ClientError::SessionExists`] if `name` is taken, and
    /// [`ClientError::Config`] if `config` does not validate.
    pub fn create(&self, name: &str, config: ClientConfig) -> Result<Session, ClientError> {
        config.validate()?;
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(name) {
            return Err(ClientError::SessionExists(name.to_owned()));
        }
        let session = Session::new(config);
        sessions.insert(name.to_owned(), session.clone());
        drop(sessions);
        info!(name, session_id = %session.session_id(), "session registered");
        Ok(session)
    }

    /// Look up a session.
    pub fn get(&self, name: &str) -> Option<Session> {
        lock(&self.sessions).get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Disconnect and remove one session. Returns `false` if unknown.
    pub async fn dispose(&self, name: &str) -> bool {
        let removed = lock(&self.sessions).remove(name);
        match removed {
            Some(session) => {
                session.disconnect().await;
                info!(name, "session disposed");
                true
            }
            None => false,
        }
    }

    /// Disconnect and remove every session.
    pub async fn dispose_all(&self) {
        let drained: Vec<(String, Session)> = std::mem::take(&mut *lock(&self.sessions))
            .into_iter()
            .collect();
        for (name, session) in drained {
            session.disconnect().await;
            info!(name, "session disposed");
        }
    }
}
