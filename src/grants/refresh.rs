//! The refresh token grant, rfc6749 §6.
//!
//! Refresh tokens are sealed payloads like authorization codes. Redeeming one rotates it: the
//! old handle is retired through the single-use set and a fresh refresh token accompanies the
//! new access token. The requested scope may narrow the grant but never widen it.
use chrono::Utc;

use crate::error::{Error, ProtocolError};
use crate::primitives::issuer::IssueParams;
use crate::primitives::scope::ScopeSet;
use crate::primitives::sealed::SealedKind;

use super::{issue_refresh_token, Credentials, GrantContext, GrantType, TokenRequest, TokenResponse};

/// Handles `grant_type=refresh_token`.
#[derive(Default)]
pub struct RefreshTokenGrant {
    _private: (),
}

impl GrantType for RefreshTokenGrant {
    fn identifier(&self) -> &str {
        super::REFRESH_TOKEN
    }

    fn respond(&self, ctx: &GrantContext, request: &dyn TokenRequest) -> Result<TokenResponse, Error> {
        if !request.valid() {
            return Err(ProtocolError::invalid_request("malformed token request").into());
        }

        let client_id = Credentials::from_request(request).authenticate(ctx.registrar)?;

        let token = request
            .parameter("refresh_token")
            .ok_or_else(|| ProtocolError::invalid_request("missing `refresh_token` parameter"))?;

        let payload = ctx
            .codec
            .unseal(&token, SealedKind::Refresh)
            .map_err(|_| ProtocolError::invalid_grant("refresh token is not valid"))?;

        if payload.client_id != client_id {
            return Err(
                ProtocolError::invalid_grant("refresh token was issued to another client").into(),
            );
        }

        if payload.until < Utc::now() {
            return Err(ProtocolError::invalid_grant("refresh token expired").into());
        }

        let scope = match request.parameter("scope") {
            None => payload.scope.clone(),
            Some(requested) => {
                let requested: ScopeSet = requested
                    .parse()
                    .map_err(|err: crate::primitives::scope::ParseScopeErr| {
                        ProtocolError::invalid_scope(err.to_string())
                    })?;
                if !requested.is_subset_of(&payload.scope) {
                    return Err(ProtocolError::invalid_scope(
                        "requested scope exceeds the original grant",
                    )
                    .into());
                }
                requested
            }
        };

        let fresh = ctx
            .tokens
            .consume_once(&payload.handle_id)
            .map_err(Error::Repository)?;
        if !fresh {
            return Err(ProtocolError::invalid_grant("refresh token already used").into());
        }

        let signed = ctx.issuer.issue(
            ctx.tokens,
            IssueParams {
                client_id: client_id.clone(),
                user_id: payload.user_id.clone(),
                scope: scope.clone(),
                ttl: None,
            },
        )?;

        let refresh_token =
            issue_refresh_token(ctx, &client_id, payload.user_id.as_deref(), &scope)?;

        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: (signed.until - Utc::now()).num_seconds(),
            refresh_token,
            scope: Some(scope.to_string()),
            id_token: None,
            user_id: payload.user_id,
        })
    }
}
