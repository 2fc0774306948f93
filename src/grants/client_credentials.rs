//! The client credentials grant, rfc6749 §4.4, with the default-user extension.
//!
//! A client credentials grant normally acts for the client itself. Deployments that want such
//! machine tokens to act for a real account configure a `default_grant_user_id` on the client;
//! the engine then verifies that this user has actually authorized the client (and the
//! requested scopes) through the regular consent bookkeeping, and issues the token on the
//! user's behalf. Missing authorization is a server error, the deployment promised a user that
//! never consented, and must never silently widen the grant.
use chrono::Utc;

use crate::consent::resolve;
use crate::error::{Error, ProtocolError, ServerError};
use crate::primitives::issuer::IssueParams;
use crate::primitives::scope::ScopeSet;

use super::{Credentials, GrantContext, GrantType, TokenRequest, TokenResponse};

/// Handles `grant_type=client_credentials`.
#[derive(Default)]
pub struct ClientCredentialsGrant {
    _private: (),
}

impl GrantType for ClientCredentialsGrant {
    fn identifier(&self) -> &str {
        super::CLIENT_CREDENTIALS
    }

    fn respond(&self, ctx: &GrantContext, request: &dyn TokenRequest) -> Result<TokenResponse, Error> {
        if !request.valid() {
            return Err(ProtocolError::invalid_request("malformed token request").into());
        }

        let credentials = Credentials::from_request(request);
        if let Credentials::Unauthenticated { .. } = credentials {
            // Public clients cannot keep a secret; the rfc restricts this grant to
            // confidential clients.
            return Err(ProtocolError::invalid_client(
                "client credentials grant requires an authenticated client",
            )
            .into());
        }
        let client_id = credentials.authenticate(ctx.registrar)?;
        let client = ctx
            .registrar
            .find_client(&client_id)
            .map_err(|_| ProtocolError::invalid_client("unknown client"))?;

        let requested = match request.parameter("scope") {
            Some(scope) => scope
                .parse::<ScopeSet>()
                .map_err(|err| ProtocolError::invalid_scope(err.to_string()))?,
            None => ScopeSet::new(),
        };

        let undefined: Vec<_> = requested
            .iter()
            .filter(|scope| client.scope_entry(scope.as_str()).is_none())
            .map(|scope| scope.as_str().to_string())
            .collect();
        if !undefined.is_empty() {
            return Err(ProtocolError::invalid_scope(format!(
                "scopes not defined for this client: {}",
                undefined.join(", ")
            ))
            .into());
        }

        let (user_id, scope) = match client.default_grant_user_id.clone() {
            None => (None, requested.union(&client.automatic_scopes())),
            Some(user_id) => {
                let scope = self.resolve_default_user(ctx, &client, &user_id, &requested)?;
                (Some(user_id), scope)
            }
        };

        let signed = ctx.issuer.issue(
            ctx.tokens,
            IssueParams {
                client_id: client_id.clone(),
                user_id: user_id.clone(),
                scope: scope.clone(),
                ttl: None,
            },
        )?;

        // No refresh token: the client can authenticate again at any time (rfc6749 §4.4.3).
        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: (signed.until - Utc::now()).num_seconds(),
            refresh_token: None,
            scope: Some(scope.to_string()),
            id_token: None,
            user_id,
        })
    }
}

impl ClientCredentialsGrant {
    /// Check the consent bookkeeping for the configured default grant user and compute the
    /// scopes the grant may carry:
    /// previously approved ∩ requested, plus the automatically applied scopes.
    fn resolve_default_user(
        &self, ctx: &GrantContext, client: &crate::primitives::registrar::ClientRecord,
        user_id: &str, requested: &ScopeSet,
    ) -> Result<ScopeSet, Error> {
        let user = ctx
            .users
            .find_by_identifier(user_id)
            .map_err(Error::Repository)?
            .ok_or_else(|| {
                ServerError(format!(
                    "user id \"{}\" is set as default client credentials grant user for client \
                     \"{}\" but does not exist",
                    user_id, client.client_id
                ))
            })?;

        let authorized = ctx
            .approvals
            .has_client_approval(&user.identifier, &client.client_id)
            .map_err(Error::Repository)?;
        if client.requires_user_authorization && !authorized {
            return Err(ServerError(format!(
                "user id \"{}\" is set as default client credentials grant user for client \
                 \"{}\" but the client is not authorized for this user",
                user_id, client.client_id
            ))
            .into());
        }

        let approved = ctx
            .approvals
            .approved_scopes(&user.identifier, &client.client_id)
            .map_err(Error::Repository)?;
        let resolution = resolve(client, requested, &approved);

        if resolution.needs_consent() {
            let pending: Vec<_> = resolution
                .pending
                .iter()
                .map(|scope| scope.as_str().to_string())
                .collect();
            return Err(ServerError(format!(
                "user id \"{}\" is set as default client credentials grant user for client \
                 \"{}\" but the following scopes are not approved: {}",
                user_id,
                client.client_id,
                pending.join(", ")
            ))
            .into());
        }

        Ok(resolution.granted())
    }
}
