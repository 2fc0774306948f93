//! Session-backed persistence for in-flight consent interactions.
//!
//! The engine does not own the user session; the embedding application provides byte-level
//! access via [`SessionStore`]. [`ConsentSessions`] layers the namespaced key format and the
//! serialization on top, and treats every malformed or mismatching stored value as absent:
//! the worst outcome of a corrupted session entry is a restarted authorization flow.
use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::error::RepositoryError;

use super::request::ClientAuthorizationRequest;

/// Byte-level access to the current user session.
///
/// Keys are scoped to the session of the end user by the embedding application, the engine
/// only ever sees its own namespaced keys.
pub trait SessionStore {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError>;

    /// Write a value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RepositoryError>;

    /// Remove a value.
    fn remove(&self, key: &str) -> Result<(), RepositoryError>;
}

impl<T: SessionStore + ?Sized> SessionStore for &'_ T {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RepositoryError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), RepositoryError> {
        (**self).remove(key)
    }
}

impl<T: SessionStore + ?Sized> SessionStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RepositoryError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), RepositoryError> {
        (**self).remove(key)
    }
}

/// An in-memory session, for tests and trivial single-process deployments.
#[derive(Default)]
pub struct MemorySession {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySession {
    /// Create an empty session.
    pub fn new() -> MemorySession {
        MemorySession::default()
    }
}

impl SessionStore for MemorySession {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let values = self.values.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), RepositoryError> {
        let mut values = self.values.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RepositoryError> {
        let mut values = self.values.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        values.remove(key);
        Ok(())
    }
}

const SESSION_KEY_PREFIX: &str = "OAUTH2_CLIENT_AUTHORIZATION_REQUEST_";

/// Stores [`ClientAuthorizationRequest`]s in a [`SessionStore`].
///
/// Two interactions for the same user at the same time both work, each under its own request
/// id. Concurrent completion of the *same* interaction from two browser tabs is last-write-
/// wins; the engine adds no locking on top of the session back-end.
pub struct ConsentSessions<'a> {
    session: &'a dyn SessionStore,
}

impl<'a> ConsentSessions<'a> {
    /// Wrap the session of the current user.
    pub fn new(session: &'a dyn SessionStore) -> Self {
        ConsentSessions { session }
    }

    fn key(request_id: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, request_id)
    }

    /// Persist the current state of an interaction under its request id.
    pub fn save(&self, request: &ClientAuthorizationRequest) -> Result<(), RepositoryError> {
        let bytes = rmp_serde::to_vec(request)
            .map_err(|err| RepositoryError::message(format!("serializing consent state: {}", err)))?;
        self.session.set(&Self::key(request.request_id()), bytes)
    }

    /// Load an interaction by request id.
    ///
    /// A value that fails to deserialize, or whose embedded request id differs from the lookup
    /// key, is logged and treated as absent so the caller restarts the flow.
    pub fn load(&self, request_id: &str) -> Result<Option<ClientAuthorizationRequest>, RepositoryError> {
        let bytes = match self.session.get(&Self::key(request_id))? {
            None => return Ok(None),
            Some(bytes) => bytes,
        };

        let request: ClientAuthorizationRequest = match rmp_serde::from_slice(&bytes) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    request_id,
                    error = %err,
                    "stored client authorization request failed to deserialize, discarding"
                );
                return Ok(None);
            }
        };

        if request.request_id() != request_id {
            warn!(
                request_id,
                stored_id = request.request_id(),
                "stored client authorization request id does not match its session key, discarding"
            );
            return Ok(None);
        }

        Ok(Some(request))
    }

    /// Remove an interaction, typically after its redirect was produced.
    pub fn remove(&self, request_id: &str) -> Result<(), RepositoryError> {
        self.session.remove(&Self::key(request_id))
    }
}
