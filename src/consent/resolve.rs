//! Partitioning of requested scopes against the client definition and the consent history.
//!
//! This is the heart of the consent workflow and deliberately a pure function: given what the
//! client asked for, what the client is allowed to ask for and what the user decided before,
//! every requested identifier lands in exactly one bucket. The caller turns the buckets into a
//! consent screen, an error, or an immediate issuance.
use crate::primitives::registrar::ClientRecord;
use crate::primitives::scope::ScopeSet;

/// The outcome of partitioning one scope request.
///
/// The buckets are disjoint; their union is the requested set plus the client's automatic
/// scopes. `approved_now` starts empty and is filled by the consent interaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopeResolution {
    /// Scopes the user must still decide on.
    pub pending: ScopeSet,

    /// Scopes approved during the current interaction.
    pub approved_now: ScopeSet,

    /// Scopes the user approved in an earlier interaction.
    pub previously_approved: ScopeSet,

    /// Scopes granted without asking, per the client definition.
    pub auto_applied: ScopeSet,

    /// Requested scopes the client does not define. Never silently dropped; the caller turns a
    /// non-empty bucket into an `invalid_scope` error.
    pub denied: ScopeSet,
}

impl ScopeResolution {
    /// Whether a consent interaction is required before issuing.
    pub fn needs_consent(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The scopes an approval would grant right now: everything already decided positively.
    ///
    /// `(previously approved ∩ requested) ∪ auto-applied ∪ approved now`.
    pub fn granted(&self) -> ScopeSet {
        self.previously_approved
            .union(&self.auto_applied)
            .union(&self.approved_now)
    }
}

/// Partition the requested scopes.
///
/// Precedence per identifier, first match wins:
/// 1. not defined for the client → `denied`
/// 2. defined as applied automatically → `auto_applied`
/// 3. approved by this user for this client before → `previously_approved`
/// 4. otherwise → `pending`
///
/// The client's automatic scopes join `auto_applied` whether requested or not; an earlier
/// user denial does not override the client definition there. A scope the user denied in an
/// earlier interaction simply shows up as `pending` again when requested, the user may well
/// change their mind.
pub fn resolve(
    client: &ClientRecord, requested: &ScopeSet, previously_approved: &ScopeSet,
) -> ScopeResolution {
    let mut resolution = ScopeResolution::default();

    for scope in requested.iter() {
        let entry = match client.scope_entry(scope.as_str()) {
            None => {
                resolution.denied.insert(scope.clone());
                continue;
            }
            Some(entry) => entry,
        };

        if entry.applied_automatically {
            resolution.auto_applied.insert(scope.clone());
        } else if previously_approved.contains(scope.as_str()) {
            resolution.previously_approved.insert(scope.clone());
        } else {
            resolution.pending.insert(scope.clone());
        }
    }

    // Automatic scopes apply regardless of the request.
    for scope in client.automatic_scopes().iter() {
        resolution.auto_applied.insert(scope.clone());
    }

    resolution
}
