//! Approval stores remember what a user has already consented to.
//!
//! Consent is tracked on two levels: a client-level authorization (the user has allowed this
//! client at all) and per-scope approvals. Both feed the scope resolution of later requests so
//! returning users only get asked about scopes they have not approved yet. A denial revokes
//! any earlier approval of the scope but is not held against future requests: the scope is
//! simply asked again, the user may change their mind.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RepositoryError;

use super::scope::ScopeSet;

/// The consent history of one user and client pair.
pub trait ApprovalStore: Send + Sync {
    /// Whether the user has authorized the client at all.
    fn has_client_approval(&self, user_id: &str, client_id: &str) -> Result<bool, RepositoryError>;

    /// The scopes the user has approved for this client in the past.
    fn approved_scopes(&self, user_id: &str, client_id: &str) -> Result<ScopeSet, RepositoryError>;

    /// Record the outcome of a consent interaction.
    ///
    /// Establishes the client-level authorization, merges the approvals into the history and
    /// revokes the approval of every denied scope.
    fn record_decision(
        &self, user_id: &str, client_id: &str, approved: &ScopeSet, denied: &ScopeSet,
    ) -> Result<(), RepositoryError>;
}

impl<T: ApprovalStore + ?Sized> ApprovalStore for Box<T> {
    fn has_client_approval(&self, user_id: &str, client_id: &str) -> Result<bool, RepositoryError> {
        (**self).has_client_approval(user_id, client_id)
    }

    fn approved_scopes(&self, user_id: &str, client_id: &str) -> Result<ScopeSet, RepositoryError> {
        (**self).approved_scopes(user_id, client_id)
    }

    fn record_decision(
        &self, user_id: &str, client_id: &str, approved: &ScopeSet, denied: &ScopeSet,
    ) -> Result<(), RepositoryError> {
        (**self).record_decision(user_id, client_id, approved, denied)
    }
}

impl<T: ApprovalStore + ?Sized> ApprovalStore for Arc<T> {
    fn has_client_approval(&self, user_id: &str, client_id: &str) -> Result<bool, RepositoryError> {
        (**self).has_client_approval(user_id, client_id)
    }

    fn approved_scopes(&self, user_id: &str, client_id: &str) -> Result<ScopeSet, RepositoryError> {
        (**self).approved_scopes(user_id, client_id)
    }

    fn record_decision(
        &self, user_id: &str, client_id: &str, approved: &ScopeSet, denied: &ScopeSet,
    ) -> Result<(), RepositoryError> {
        (**self).record_decision(user_id, client_id, approved, denied)
    }
}

/// In-memory consent history keyed by (user, client).
#[derive(Default)]
pub struct MemoryApprovals {
    entries: Mutex<HashMap<(String, String), ScopeSet>>,
}

impl MemoryApprovals {
    /// Create an empty history.
    pub fn new() -> MemoryApprovals {
        MemoryApprovals::default()
    }
}

impl ApprovalStore for MemoryApprovals {
    fn has_client_approval(&self, user_id: &str, client_id: &str) -> Result<bool, RepositoryError> {
        let entries = self.entries.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(entries.contains_key(&(user_id.to_string(), client_id.to_string())))
    }

    fn approved_scopes(&self, user_id: &str, client_id: &str) -> Result<ScopeSet, RepositoryError> {
        let entries = self.entries.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(entries
            .get(&(user_id.to_string(), client_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn record_decision(
        &self, user_id: &str, client_id: &str, approved: &ScopeSet, denied: &ScopeSet,
    ) -> Result<(), RepositoryError> {
        let mut entries = self.entries.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        let entry = entries
            .entry((user_id.to_string(), client_id.to_string()))
            .or_default();
        *entry = entry.difference(denied).union(approved);
        Ok(())
    }
}
