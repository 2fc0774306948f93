//! The authorization server façade.
//!
//! One [`AuthorizationServer`] instance serves the authorization endpoint, the token endpoint
//! and the supporting documents (JWKS, discovery). It owns the resolved grant handlers and the
//! key material; the pluggable stores are handed in as [`Collaborators`] at construction. All
//! operations take `&self`, the façade is shared between request handlers.
use std::borrow::Cow;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::debug;
use url::Url;

use crate::consent::{
    ClientAuthorizationRequest, ConsentDecision, ConsentSessions, ConsentStage, SessionStore,
};
use crate::consent::resolve;
use crate::error::{ConfigError, Error, InvalidCallError, ProtocolError, ProtocolErrorKind};
use crate::grants::authorization_code::seal_authorization_code;
use crate::grants::{
    Credentials, GrantContext, GrantRegistry, RefreshRule, TokenRequest, TokenResponse,
    AUTHORIZATION_CODE,
};
use crate::keys::KeySet;
use crate::oidc;
use crate::oidc::IdTokenIssuer;
use crate::primitives::approvals::ApprovalStore;
use crate::primitives::issuer::{TokenIssuer, TokenStore};
use crate::primitives::registrar::{ClientUrl, Registrar, RegistrarError};
use crate::primitives::scope::ScopeSet;
use crate::primitives::sealed::SealedCodec;
use crate::primitives::users::UserStore;

use super::config::{ServerConfig, ServerRole};

/// Maximum age of a stored, unfinished consent interaction.
const CONSENT_REQUEST_TTL_HOURS: i64 = 1;

/// The pluggable back-ends of an authorization server.
pub struct Collaborators {
    /// Client registry.
    pub registrar: Box<dyn Registrar + Send + Sync>,

    /// Issued-token records, revocation and single-use enforcement.
    pub tokens: Box<dyn TokenStore>,

    /// Consent history.
    pub approvals: Box<dyn ApprovalStore>,

    /// User identity lookup.
    pub users: Box<dyn UserStore>,
}

/// The parameters of an authorization endpoint request, supplied by the embedding application.
pub trait AuthorizeRequest {
    /// Whether the request is syntactically valid (parseable query, no repeated parameters).
    fn valid(&self) -> bool;

    /// The `client_id` query parameter.
    fn client_id(&self) -> Option<Cow<str>>;

    /// The `redirect_uri` query parameter.
    fn redirect_uri(&self) -> Option<Cow<str>>;

    /// The `scope` query parameter.
    fn scope(&self) -> Option<Cow<str>>;

    /// The `state` query parameter.
    fn state(&self) -> Option<Cow<str>>;

    /// The `response_type` query parameter.
    fn response_type(&self) -> Option<Cow<str>>;
}

/// What the authorization endpoint should do next.
#[derive(Clone, Debug)]
pub enum AuthorizeOutcome {
    /// User input is needed; send the user agent to the consent screen.
    Consent {
        /// Identifier of the stored interaction, also embedded in `location`.
        request_id: String,

        /// The consent screen url, carrying the request id as a query parameter.
        location: Url,
    },

    /// The request was decided without interaction; redirect the user agent. The url carries
    /// either a `code` or an error response.
    Redirect(Url),
}

/// The authorization-server half of the engine.
pub struct AuthorizationServer {
    config: ServerConfig,
    keys: Arc<KeySet>,
    grants: GrantRegistry,
    issuer: TokenIssuer,
    id_tokens: Option<IdTokenIssuer>,
    codec: SealedCodec,
    consent_url: Url,
    refresh_rule: RefreshRule,
    registrar: Box<dyn Registrar + Send + Sync>,
    tokens: Box<dyn TokenStore>,
    approvals: Box<dyn ApprovalStore>,
    users: Box<dyn UserStore>,
}

impl AuthorizationServer {
    /// Construct the façade, validating the whole configuration up front.
    ///
    /// Fails with a [`ConfigError`] naming the defect: the disabled role, the missing setting,
    /// the unreadable key file or the unknown grant type.
    pub fn new(mut config: ServerConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        if !config.server_role.contains(ServerRole::AUTHORIZATION_SERVER) {
            return Err(ConfigError::DisabledRole("authorization_server"));
        }
        if config.issuer_url.is_empty() {
            return Err(ConfigError::MissingSetting("issuer_url"));
        }
        Url::parse(&config.issuer_url).map_err(|err| ConfigError::InvalidUrl {
            name: "issuer_url",
            reason: err.to_string(),
        })?;
        let consent_url = Url::parse(&config.endpoint_url(&config.endpoints.authorize_client))
            .map_err(|err| ConfigError::InvalidUrl {
                name: "endpoints.authorize_client",
                reason: err.to_string(),
            })?;

        let keys = Arc::new(KeySet::from_config(&config.keys)?);
        let codes_key = keys
            .codes_key()
            .ok_or(ConfigError::MissingSetting("codes_encryption_key"))?;
        let codec = SealedCodec::new(codes_key);

        let grants = GrantRegistry::resolve(std::mem::take(&mut config.grant_types))?;
        let issuer = TokenIssuer::new(
            Arc::clone(&keys),
            config.issuer_url.trim_end_matches('/').to_string(),
            config.default_access_token_ttl,
        );
        let id_tokens = config.enable_openid_connect.then(|| {
            IdTokenIssuer::new(
                Arc::clone(&keys),
                config.issuer_url.trim_end_matches('/').to_string(),
                config.default_access_token_ttl,
            )
        });
        let refresh_rule = oidc::refresh_rule_for(&config);

        Ok(AuthorizationServer {
            config,
            keys,
            grants,
            issuer,
            id_tokens,
            codec,
            consent_url,
            refresh_rule,
            registrar: collaborators.registrar,
            tokens: collaborators.tokens,
            approvals: collaborators.approvals,
            users: collaborators.users,
        })
    }

    /// The configuration the façade was built with (grant types moved out).
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The response-body message for an error, honoring
    /// `display_confidential_exception_messages`.
    pub fn public_error_message(&self, err: &Error) -> String {
        err.public_message(self.config.display_confidential_exception_messages)
    }

    /// The rfc7517 key set document for the `certs` endpoint.
    pub fn jwks(&self) -> serde_json::Value {
        self.keys.jwks()
    }

    /// The OpenID Connect discovery document, `None` when discovery is disabled.
    pub fn discovery_document(&self) -> Option<serde_json::Value> {
        if !self.config.enable_openid_connect_discovery {
            return None;
        }
        let identifiers;
        let grant_types = if self.config.openid_connect_discovery_include_supported_grant_types {
            identifiers = self.grants.identifiers();
            Some(identifiers.as_slice())
        } else {
            None
        };
        Some(oidc::discovery_document(&self.config, grant_types))
    }

    /// Handle an authorization endpoint request.
    ///
    /// `authenticated_user` is the identifier of the currently logged-in user, `None` when the
    /// session is anonymous. The outcome is either a redirect back to the client (a code, or a
    /// protocol error rendered into the redirect query) or a hop to the consent screen with the
    /// interaction stored in the session.
    ///
    /// Errors that occur before the redirect uri is bound to the client are returned directly;
    /// the rfc forbids redirecting to an unvalidated url.
    pub fn issue_authorization_response(
        &self, request: &dyn AuthorizeRequest, session: &dyn SessionStore,
        authenticated_user: Option<&str>,
    ) -> Result<AuthorizeOutcome, Error> {
        if !request.valid() {
            return Err(ProtocolError::invalid_request("malformed authorization request").into());
        }
        let client_id = request
            .client_id()
            .ok_or_else(|| ProtocolError::invalid_request("missing `client_id` parameter"))?
            .into_owned();
        let redirect_uri = match request.redirect_uri() {
            None => None,
            Some(raw) => Some(Url::parse(&raw).map_err(|_| {
                ProtocolError::invalid_request("`redirect_uri` is not a valid url")
            })?),
        };

        let bound = self
            .registrar
            .bound_redirect(ClientUrl {
                client_id: Cow::Borrowed(&client_id),
                redirect_uri: redirect_uri.as_ref().map(Cow::Borrowed),
            })
            .map_err(|err| match err {
                RegistrarError::Unspecified => {
                    ProtocolError::invalid_request("unknown client or redirect uri")
                }
                RegistrarError::PrimitiveError => ProtocolError::new(ProtocolErrorKind::ServerError)
                    .with_description("client registry failure"),
            })?;
        let redirect_uri = bound.redirect_uri.into_owned();
        let state = request.state().map(Cow::into_owned);

        // From here on errors redirect back to the client.
        if request.response_type().as_deref() != Some("code") {
            let err = ProtocolError::new(ProtocolErrorKind::UnsupportedResponseType)
                .with_description("only `response_type=code` is supported");
            return Ok(AuthorizeOutcome::Redirect(redirect_with_error(
                &redirect_uri,
                &err,
                state.as_deref(),
            )));
        }

        let requested: ScopeSet = match request.scope().as_deref().unwrap_or("").parse() {
            Ok(requested) => requested,
            Err(_) => {
                let err = ProtocolError::invalid_scope("malformed scope parameter");
                return Ok(AuthorizeOutcome::Redirect(redirect_with_error(
                    &redirect_uri,
                    &err,
                    state.as_deref(),
                )));
            }
        };

        let record = self.registrar.find_client(&client_id).map_err(|_| {
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description("client registry failure")
        })?;

        let (previously_approved, authorized_before) = match authenticated_user {
            Some(user) => (
                self.approvals.approved_scopes(user, &client_id)?,
                self.approvals.has_client_approval(user, &client_id)?,
            ),
            None => (ScopeSet::new(), false),
        };
        let resolution = resolve(&record, &requested, &previously_approved);

        if !resolution.denied.is_empty() {
            let err = ProtocolError::invalid_scope(format!(
                "scopes not defined for this client: {}",
                resolution.denied
            ));
            return Ok(AuthorizeOutcome::Redirect(redirect_with_error(
                &redirect_uri,
                &err,
                state.as_deref(),
            )));
        }

        match authenticated_user {
            Some(user)
                if !record.requires_user_authorization
                    || (authorized_before && !resolution.needs_consent()) =>
            {
                // No interaction needed. Clients exempt from user authorization get every
                // defined scope they asked for, others get what was already approved.
                let granted = if record.requires_user_authorization {
                    resolution.granted()
                } else {
                    resolution
                        .pending
                        .union(&resolution.previously_approved)
                        .union(&resolution.auto_applied)
                };
                let code = seal_authorization_code(
                    &self.codec,
                    &client_id,
                    user,
                    &granted,
                    &redirect_uri,
                )?;
                Ok(AuthorizeOutcome::Redirect(redirect_with_code(
                    &redirect_uri,
                    &code,
                    state.as_deref(),
                )))
            }
            user => {
                let consent = ClientAuthorizationRequest::new(
                    &record,
                    user,
                    requested,
                    AUTHORIZATION_CODE,
                    redirect_uri,
                    state,
                    &resolution,
                    authorized_before,
                );
                ConsentSessions::new(session).save(&consent)?;
                debug!(
                    request_id = consent.request_id(),
                    client_id = consent.client_id(),
                    "authorization request stored, awaiting consent"
                );

                let mut location = self.consent_url.clone();
                location
                    .query_pairs_mut()
                    .append_pair("clientAuthorizationRequestId", consent.request_id());
                Ok(AuthorizeOutcome::Consent {
                    request_id: consent.request_id().to_string(),
                    location,
                })
            }
        }
    }

    /// Load a stored consent interaction for the consent screen.
    pub fn load_authorization_request(
        &self, session: &dyn SessionStore, request_id: &str,
    ) -> Result<Option<ClientAuthorizationRequest>, Error> {
        Ok(ConsentSessions::new(session).load(request_id)?)
    }

    /// Persist a mutated consent interaction (user attached, scopes decided, processed).
    pub fn store_authorization_request(
        &self, session: &dyn SessionStore, request: &ClientAuthorizationRequest,
    ) -> Result<(), Error> {
        Ok(ConsentSessions::new(session).save(request)?)
    }

    /// Complete an authorization request after its consent interaction was processed.
    ///
    /// Records the decision in the approval store, produces the redirect back to the client
    /// (carrying a code or `access_denied`) and removes the stored interaction. A missing or
    /// expired interaction is an `invalid_request`; the client has to restart the flow.
    pub fn resume_authorization(
        &self, request_id: &str, session: &dyn SessionStore,
    ) -> Result<Url, Error> {
        let sessions = ConsentSessions::new(session);
        let request = sessions.load(request_id)?.ok_or_else(|| {
            ProtocolError::invalid_request("unknown authorization request, restart the flow")
        })?;

        if request.created_at() + Duration::hours(CONSENT_REQUEST_TTL_HOURS) < Utc::now() {
            sessions.remove(request_id)?;
            return Err(ProtocolError::invalid_request(
                "authorization request expired, restart the flow",
            )
            .into());
        }

        let decision = match request.stage() {
            ConsentStage::Finalized(decision) => decision,
            _ => {
                return Err(InvalidCallError::new(
                    "resuming an authorization request that was not processed",
                )
                .into())
            }
        };

        match decision {
            ConsentDecision::Approved => {
                let user_id = request.user_id().ok_or_else(|| {
                    InvalidCallError::new("approved authorization request without a user identity")
                })?;
                self.approvals.record_decision(
                    user_id,
                    request.client_id(),
                    &request.approved_now_scopes(),
                    &request.denied_requested_scopes(),
                )?;
                let code = seal_authorization_code(
                    &self.codec,
                    request.client_id(),
                    user_id,
                    &request.granted_scopes(),
                    request.redirect_uri(),
                )?;
                sessions.remove(request_id)?;
                Ok(redirect_with_code(request.redirect_uri(), &code, request.state()))
            }
            ConsentDecision::Denied => {
                sessions.remove(request_id)?;
                let err = ProtocolError::access_denied("the user denied the authorization request");
                Ok(redirect_with_error(request.redirect_uri(), &err, request.state()))
            }
        }
    }

    /// Handle a token endpoint request, dispatching to the enabled grant handler.
    ///
    /// With OpenID Connect enabled, grants carrying the `openid` scope on behalf of a user get
    /// an id token attached to the response.
    pub fn issue_token_response(&self, request: &dyn TokenRequest) -> Result<TokenResponse, Error> {
        let grant_type = request
            .grant_type()
            .ok_or_else(|| ProtocolError::invalid_request("missing `grant_type` parameter"))?
            .into_owned();
        let grant = self.grants.find(&grant_type).ok_or_else(|| {
            ProtocolError::new(ProtocolErrorKind::UnsupportedGrantType)
                .with_description(format!("grant type `{}` is not enabled", grant_type))
        })?;

        let ctx = GrantContext {
            registrar: &*self.registrar,
            tokens: &*self.tokens,
            issuer: &self.issuer,
            codec: &self.codec,
            approvals: &*self.approvals,
            users: &*self.users,
            refresh_ttl: self.config.refresh_token_ttl,
            refresh_rule: self.refresh_rule,
        };
        let mut response = grant.respond(&ctx, request)?;

        if let (Some(id_tokens), Some(user_id)) = (&self.id_tokens, response.user_id.clone()) {
            let granted: ScopeSet = response.scope.as_deref().unwrap_or("").parse().unwrap_or_default();
            if granted.contains("openid") {
                if let (Some(user), Some(client_id)) = (
                    self.users.find_by_identifier(&user_id)?,
                    request_client_id(request),
                ) {
                    response.id_token =
                        Some(id_tokens.issue(&client_id, &user, &granted, None)?);
                }
            }
        }

        Ok(response)
    }
}

/// The client id a token request claims, without authenticating it.
fn request_client_id(request: &dyn TokenRequest) -> Option<String> {
    match Credentials::from_request(request) {
        Credentials::Authenticated { client_id, .. }
        | Credentials::Unauthenticated { client_id } => Some(client_id.into_owned()),
        _ => None,
    }
}

fn redirect_with_code(redirect_uri: &Url, code: &str, state: Option<&str>) -> Url {
    let mut url = redirect_uri.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    url
}

fn redirect_with_error(redirect_uri: &Url, err: &ProtocolError, state: Option<&str>) -> Url {
    let mut url = redirect_uri.clone();
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in err.iter() {
            pairs.append_pair(key, &value);
        }
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    url
}
