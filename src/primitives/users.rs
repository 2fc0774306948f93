//! User stores resolve user identifiers to their identity record.
//!
//! The engine never authenticates users itself; the embedding application does that and hands
//! over the identifier. The store is consulted for two things: resolving the configured
//! default grant user of a client credentials client, and collecting the claims that go into
//! id tokens and the userinfo response.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RepositoryError;

/// The identity record of a user.
#[derive(Clone, Debug, Default)]
pub struct UserRecord {
    /// The unique identifier of the user.
    pub identifier: String,

    /// OpenID Connect claims of this user (`name`, `email`, ...).
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl UserRecord {
    /// A record with just the identifier and no claims.
    pub fn new(identifier: &str) -> UserRecord {
        UserRecord {
            identifier: identifier.to_string(),
            claims: serde_json::Map::new(),
        }
    }

    /// Attach a claim value.
    pub fn with_claim(mut self, name: &str, value: serde_json::Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }
}

/// Looks up users by their identifier.
pub trait UserStore: Send + Sync {
    /// Find a user, `Ok(None)` when the identifier is unknown.
    fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>, RepositoryError>;
}

impl<T: UserStore + ?Sized> UserStore for Box<T> {
    fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>, RepositoryError> {
        (**self).find_by_identifier(identifier)
    }
}

impl<T: UserStore + ?Sized> UserStore for Arc<T> {
    fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>, RepositoryError> {
        (**self).find_by_identifier(identifier)
    }
}

/// A simple in-memory user store.
#[derive(Default)]
pub struct MemoryUsers {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl MemoryUsers {
    /// Create an empty store.
    pub fn new() -> MemoryUsers {
        MemoryUsers::default()
    }

    /// Insert or replace a user record.
    pub fn add_user(&self, record: UserRecord) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(record.identifier.clone(), record);
        }
    }
}

impl UserStore for MemoryUsers {
    fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>, RepositoryError> {
        let users = self.users.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(users.get(identifier).cloned())
    }
}
