//! The resource server façade: bearer token validation for protected endpoints.
use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, Validation};

use crate::error::{ConfigError, Error, ProtocolError, ProtocolErrorKind};
use crate::keys::KeySet;
use crate::primitives::issuer::{AccessClaims, TokenStore};
use crate::primitives::scope::ScopeSet;

use super::config::{ServerConfig, ServerRole};

/// A request to a protected resource, as far as the engine cares: its `Authorization` header.
pub trait ProtectedRequest {
    /// The value of the `Authorization` header, if present.
    fn authorization(&self) -> Option<Cow<str>>;
}

/// The resource-server half of the engine.
///
/// Validates the signature and expiry of bearer tokens against the configured public key; when
/// revocation validation is enabled it additionally checks each token id against the token
/// store. A pure resource server needs nothing but the public key (and the store).
pub struct ResourceServer {
    keys: Arc<KeySet>,
    tokens: Option<Box<dyn TokenStore>>,
    check_revocation: bool,
    display_confidential_messages: bool,
}

impl ResourceServer {
    /// Construct the façade.
    ///
    /// `tokens` is required when revocation validation is enabled, which it is by default;
    /// passing `None` then is a configuration defect, not a silent downgrade.
    pub fn new(
        config: &ServerConfig, tokens: Option<Box<dyn TokenStore>>,
    ) -> Result<Self, ConfigError> {
        if !config.server_role.contains(ServerRole::RESOURCE_SERVER) {
            return Err(ConfigError::DisabledRole("resource_server"));
        }
        if config.resource_server_access_token_revocation_validation && tokens.is_none() {
            return Err(ConfigError::MissingSetting(
                "token store for access token revocation validation",
            ));
        }
        let keys = Arc::new(KeySet::verification_only(&config.keys)?);
        Ok(ResourceServer {
            keys,
            tokens,
            check_revocation: config.resource_server_access_token_revocation_validation,
            display_confidential_messages: config.display_confidential_exception_messages,
        })
    }

    /// The response-body message for an error, honoring
    /// `display_confidential_exception_messages`.
    pub fn public_error_message(&self, err: &Error) -> String {
        err.public_message(self.display_confidential_messages)
    }

    /// Validate the bearer token of a request.
    ///
    /// The only way to obtain an [`AuthenticatedRequest`]: a handler holding one can rely on
    /// the token having been checked. Expired or tampered tokens fail here regardless of the
    /// revocation setting; the signature check needs no store at all.
    pub fn validate_authenticated_request(
        &self, request: &dyn ProtectedRequest,
    ) -> Result<AuthenticatedRequest, Error> {
        let header = request
            .authorization()
            .ok_or_else(|| ProtocolError::invalid_token("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| {
                ProtocolError::invalid_token("authorization header is not a bearer token")
            })?;

        let mut validation = Validation::new(Algorithm::RS256);
        // `aud` is the client id, not something the resource server knows up front.
        validation.validate_aud = false;
        let data = decode::<AccessClaims>(token, self.keys.verification_key(), &validation)
            .map_err(|err| {
                ProtocolError::invalid_token(format!("token validation failed: {}", err))
            })?;

        if self.check_revocation {
            let tokens = self.tokens.as_ref().ok_or_else(|| {
                ProtocolError::new(ProtocolErrorKind::ServerError)
                    .with_description("revocation validation enabled without a token store")
            })?;
            if tokens.is_revoked(&data.claims.jti)? {
                return Err(ProtocolError::invalid_token("token has been revoked").into());
            }
        }

        Ok(AuthenticatedRequest {
            claims: data.claims,
        })
    }
}

/// A request whose bearer token has been validated.
///
/// Only [`ResourceServer::validate_authenticated_request`] constructs this type; the claim
/// accessors are therefore always backed by a checked token.
pub struct AuthenticatedRequest {
    claims: AccessClaims,
}

impl AuthenticatedRequest {
    /// The `sub` claim: the user, or the client itself for pure client grants.
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    /// The client the token was issued to.
    pub fn client_id(&self) -> &str {
        &self.claims.client_id
    }

    /// The user the token acts for, `None` when the token acts for the client itself.
    pub fn user_id(&self) -> Option<&str> {
        if self.claims.sub == self.claims.client_id {
            None
        } else {
            Some(&self.claims.sub)
        }
    }

    /// The granted scopes.
    pub fn scopes(&self) -> ScopeSet {
        self.claims.scope_set()
    }

    /// The token id (`jti` claim).
    pub fn token_id(&self) -> &str {
        &self.claims.jti
    }

    /// When the token expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims.expires_at()
    }

    /// Demand a scope, failing with `insufficient_scope` when the token does not carry it.
    pub fn require_scope(&self, scope: &str) -> Result<(), ProtocolError> {
        if self.scopes().contains(scope) {
            Ok(())
        } else {
            Err(ProtocolError::new(ProtocolErrorKind::InsufficientScope)
                .with_description(format!("token does not carry the `{}` scope", scope)))
        }
    }
}
