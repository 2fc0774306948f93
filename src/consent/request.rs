//! The client authorization request: one user's consent interaction, from the moment an
//! authorization request needs input until the user decided.
//!
//! The request is a serializable value object. It travels through the session-backed
//! [`ConsentSessions`] store between the redirect to the consent screen and the submission of
//! the decision, so every mutation here is followed by a re-persist in the caller.
//!
//! [`ConsentSessions`]: ../store/struct.ConsentSessions.html
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::InvalidCallError;
use crate::primitives::generator::random_id;
use crate::primitives::registrar::ClientRecord;
use crate::primitives::scope::{Scope, ScopeSet};

use super::resolve::{resolve, ScopeResolution};

/// Where in its lifecycle a consent interaction is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentStage {
    /// Constructed, nothing decided yet.
    Created,

    /// Waiting for the embedding application to authenticate the user.
    AwaitingAuthentication,

    /// The user is known; scope decisions are outstanding.
    AwaitingScopeApproval,

    /// The interaction has been processed; no further mutation is allowed.
    Finalized(ConsentDecision),
}

/// The final verdict of a consent interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentDecision {
    /// The user approved the request (possibly a subset of the scopes).
    Approved,

    /// The user denied the request as a whole.
    Denied,
}

/// Decision state of a single scope within the interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    /// Waiting for the user.
    Pending,

    /// Approved in this interaction.
    ApprovedNow,

    /// Approved in an earlier interaction.
    PreviouslyApproved,

    /// Granted by the client definition without asking.
    AutoApplied,

    /// Denied, either now or because the client does not define it.
    Denied,
}

/// A scope and its decision state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeApproval {
    /// The scope under decision.
    pub scope: Scope,

    /// Its current status.
    pub status: ApprovalStatus,
}

/// One consent interaction between a user and a client.
///
/// The `request_id` is generated at construction and never changes; the session store uses it
/// as the lookup key and cross-checks it on retrieval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientAuthorizationRequest {
    request_id: String,
    client_id: String,
    user_id: Option<String>,
    requested_scopes: ScopeSet,
    grant_type: String,
    authenticated_during_request: Option<bool>,
    approvals: BTreeMap<String, ScopeApproval>,
    client_authorization_established: bool,
    redirect_uri: Url,
    state: Option<String>,
    completion_url: Option<Url>,
    created_at: DateTime<Utc>,
    stage: ConsentStage,
}

impl ClientAuthorizationRequest {
    /// Start a consent interaction for a parsed authorization request.
    ///
    /// `resolution` must come from [`resolve`] over the same client and requested scopes;
    /// `client_authorized_before` is the client-level verdict from the approval store (false
    /// when the user is not known yet).
    pub fn new(
        client: &ClientRecord, user_id: Option<&str>, requested_scopes: ScopeSet,
        grant_type: &str, redirect_uri: Url, state: Option<String>, resolution: &ScopeResolution,
        client_authorized_before: bool,
    ) -> Self {
        let mut approvals = BTreeMap::new();
        let mut record = |set: &ScopeSet, status: ApprovalStatus| {
            for scope in set.iter() {
                approvals.insert(
                    scope.as_str().to_string(),
                    ScopeApproval {
                        scope: scope.clone(),
                        status,
                    },
                );
            }
        };
        record(&resolution.pending, ApprovalStatus::Pending);
        record(&resolution.previously_approved, ApprovalStatus::PreviouslyApproved);
        record(&resolution.auto_applied, ApprovalStatus::AutoApplied);
        record(&resolution.denied, ApprovalStatus::Denied);

        let stage = if user_id.is_none() {
            ConsentStage::AwaitingAuthentication
        } else if resolution.needs_consent() {
            ConsentStage::AwaitingScopeApproval
        } else {
            ConsentStage::Created
        };

        ClientAuthorizationRequest {
            request_id: random_id(),
            client_id: client.client_id.clone(),
            user_id: user_id.map(str::to_string),
            requested_scopes,
            grant_type: grant_type.to_string(),
            authenticated_during_request: None,
            approvals,
            client_authorization_established: client_authorized_before,
            redirect_uri,
            state,
            completion_url: None,
            created_at: Utc::now(),
            stage,
        }
    }

    /// The immutable identifier of this interaction.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The client asking for authorization.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The user deciding, once known.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The scopes as originally requested, in request order.
    pub fn requested_scopes(&self) -> &ScopeSet {
        &self.requested_scopes
    }

    /// The grant type that initiated the interaction.
    pub fn grant_type(&self) -> &str {
        &self.grant_type
    }

    /// The redirect uri the request was bound to.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// The `state` parameter to echo back to the client.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// When the interaction started.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The current lifecycle stage.
    pub fn stage(&self) -> ConsentStage {
        self.stage
    }

    /// Whether the embedding application reported the user authenticated during this request,
    /// relevant for the `auth_time`/`max_age` handling of OpenID Connect.
    pub fn authenticated_during_request(&self) -> Option<bool> {
        self.authenticated_during_request
    }

    /// Attach the authenticated user. Clears nothing that was decided before.
    pub fn set_user_identity(&mut self, user_id: &str) {
        self.user_id = Some(user_id.to_string());
        if self.stage == ConsentStage::AwaitingAuthentication {
            self.stage = if self.is_scope_authorization_needed() {
                ConsentStage::AwaitingScopeApproval
            } else {
                ConsentStage::Created
            };
        }
    }

    /// Record whether the user logged in during this very request.
    pub fn set_user_authenticated_during_request(&mut self, authenticated: bool) {
        self.authenticated_during_request = Some(authenticated);
    }

    /// Set the url the embedding application navigates to once the decision is processed.
    pub fn set_completion_url(&mut self, url: Url) {
        self.completion_url = Some(url);
    }

    /// The completion url, if one was prepared.
    pub fn completion_url(&self) -> Option<&Url> {
        self.completion_url.as_ref()
    }

    /// Whether the user still has to authorize the client as such.
    pub fn is_client_authorization_needed(&self) -> bool {
        self.user_id.is_none() || !self.client_authorization_established
    }

    /// Whether any scope is still waiting for a decision.
    pub fn is_scope_authorization_needed(&self) -> bool {
        self.approvals
            .values()
            .any(|approval| approval.status == ApprovalStatus::Pending)
    }

    /// The scopes waiting for a decision, in their map order.
    pub fn pending_scopes(&self) -> ScopeSet {
        self.scopes_with(ApprovalStatus::Pending)
    }

    /// The scopes approved in earlier interactions.
    pub fn previously_approved_scopes(&self) -> ScopeSet {
        self.scopes_with(ApprovalStatus::PreviouslyApproved)
    }

    /// The scopes the client definition applies automatically.
    pub fn auto_applied_scopes(&self) -> ScopeSet {
        self.scopes_with(ApprovalStatus::AutoApplied)
    }

    /// The scopes approved during this interaction.
    pub fn approved_now_scopes(&self) -> ScopeSet {
        self.scopes_with(ApprovalStatus::ApprovedNow)
    }

    /// The requested scopes that ended up denied.
    pub fn denied_requested_scopes(&self) -> ScopeSet {
        self.scopes_with(ApprovalStatus::Denied).intersect(&self.requested_scopes)
    }

    /// The scopes a grant issued from this interaction carries, as of the current decisions.
    pub fn granted_scopes(&self) -> ScopeSet {
        self.previously_approved_scopes()
            .intersect(&self.requested_scopes)
            .union(&self.approved_now_scopes())
            .union(&self.auto_applied_scopes())
    }

    fn scopes_with(&self, status: ApprovalStatus) -> ScopeSet {
        self.approvals
            .values()
            .filter(|approval| approval.status == status)
            .map(|approval| approval.scope.clone())
            .collect()
    }

    /// Approve one pending scope.
    pub fn approve_scope(&mut self, identifier: &str) -> Result<(), InvalidCallError> {
        self.decide_scope(identifier, ApprovalStatus::ApprovedNow)
    }

    /// Deny one pending scope.
    pub fn deny_scope(&mut self, identifier: &str) -> Result<(), InvalidCallError> {
        self.decide_scope(identifier, ApprovalStatus::Denied)
    }

    fn decide_scope(&mut self, identifier: &str, status: ApprovalStatus) -> Result<(), InvalidCallError> {
        if matches!(self.stage, ConsentStage::Finalized(_)) {
            return Err(InvalidCallError::new(
                "scope decisions after the authorization request was processed",
            ));
        }
        match self.approvals.get_mut(identifier) {
            Some(approval) if approval.status == ApprovalStatus::Pending => {
                approval.status = status;
                Ok(())
            }
            Some(_) => Err(InvalidCallError::new(format!(
                "scope `{}` is not awaiting a decision",
                identifier
            ))),
            None => Err(InvalidCallError::new(format!(
                "scope `{}` is not part of this authorization request",
                identifier
            ))),
        }
    }

    /// Process the user's verdict, sealing the interaction.
    ///
    /// With `approved`, any scope still pending counts as denied for this grant (the user
    /// submitted without ticking it). The request transitions to `Finalized` and every later
    /// call is an [`InvalidCallError`]; re-processing a consent decision must never happen
    /// silently.
    pub fn process_authorization(
        &mut self, approved: bool,
    ) -> Result<ConsentVerdict, InvalidCallError> {
        if matches!(self.stage, ConsentStage::Finalized(_)) {
            return Err(InvalidCallError::new(
                "authorization request was already processed",
            ));
        }
        let user_id = self.user_id.clone().ok_or_else(|| {
            InvalidCallError::new("processing an authorization request without a user identity")
        })?;

        if !approved {
            self.stage = ConsentStage::Finalized(ConsentDecision::Denied);
            return Ok(ConsentVerdict {
                decision: ConsentDecision::Denied,
                user_id,
                granted_scopes: ScopeSet::new(),
                approved_scopes: ScopeSet::new(),
                denied_scopes: self.requested_scopes.clone(),
            });
        }

        // Leftover pending scopes were not ticked; they are denied for this grant.
        let leftover = self.pending_scopes();
        for scope in leftover.iter() {
            if let Some(approval) = self.approvals.get_mut(scope.as_str()) {
                approval.status = ApprovalStatus::Denied;
            }
        }

        let approved_scopes = self.scopes_with(ApprovalStatus::ApprovedNow);
        let denied_scopes = self
            .scopes_with(ApprovalStatus::Denied)
            .intersect(&self.requested_scopes);
        let granted_scopes = self
            .previously_approved_scopes()
            .intersect(&self.requested_scopes)
            .union(&approved_scopes)
            .union(&self.auto_applied_scopes());

        self.client_authorization_established = true;
        self.stage = ConsentStage::Finalized(ConsentDecision::Approved);

        Ok(ConsentVerdict {
            decision: ConsentDecision::Approved,
            user_id,
            granted_scopes,
            approved_scopes,
            denied_scopes,
        })
    }
}

/// The processed outcome of a consent interaction.
///
/// `approved_scopes`/`denied_scopes` are what gets written to the approval store;
/// `granted_scopes` is what the issued grant carries.
#[derive(Clone, Debug)]
pub struct ConsentVerdict {
    /// Approved or denied as a whole.
    pub decision: ConsentDecision,

    /// The user who decided.
    pub user_id: String,

    /// The scopes the resulting grant carries.
    pub granted_scopes: ScopeSet,

    /// The scopes newly approved in this interaction.
    pub approved_scopes: ScopeSet,

    /// The requested scopes that ended up denied.
    pub denied_scopes: ScopeSet,
}
