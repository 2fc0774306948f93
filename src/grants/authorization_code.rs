//! The authorization code grant, rfc6749 §4.1.
//!
//! The authorization side (consent, code creation) lives in the server façade; this handler
//! redeems a code at the token endpoint. Codes are sealed payloads, so redemption is
//! stateless except for single-use enforcement through the token store.
use chrono::{Duration, Utc};

use crate::error::{Error, ProtocolError, ProtocolErrorKind};
use crate::primitives::generator::random_id;
use crate::primitives::issuer::IssueParams;
use crate::primitives::scope::ScopeSet;
use crate::primitives::sealed::{SealedCodec, SealedKind, SealedPayload};

use super::{issue_refresh_token, Credentials, GrantContext, GrantType, TokenRequest, TokenResponse};

/// Default lifetime of an authorization code.
const CODE_TTL_MINUTES: i64 = 10;

/// Seal an authorization code for a finalized consent verdict.
///
/// Called by the authorization endpoint once issuing is decided; the token endpoint unseals
/// it again in [`AuthorizationCodeGrant::respond`].
pub fn seal_authorization_code(
    codec: &SealedCodec, client_id: &str, user_id: &str, scope: &ScopeSet,
    redirect_uri: &url::Url,
) -> Result<String, ProtocolError> {
    let payload = SealedPayload {
        kind: SealedKind::Code,
        handle_id: random_id(),
        client_id: client_id.to_string(),
        user_id: Some(user_id.to_string()),
        scope: scope.clone(),
        redirect_uri: Some(redirect_uri.clone()),
        until: Utc::now() + Duration::minutes(CODE_TTL_MINUTES),
    };
    codec.seal(&payload).map_err(|_| {
        ProtocolError::new(ProtocolErrorKind::ServerError)
            .with_description("could not seal authorization code")
    })
}

/// Redeems authorization codes for tokens.
#[derive(Default)]
pub struct AuthorizationCodeGrant {
    _private: (),
}

impl GrantType for AuthorizationCodeGrant {
    fn identifier(&self) -> &str {
        super::AUTHORIZATION_CODE
    }

    fn respond(&self, ctx: &GrantContext, request: &dyn TokenRequest) -> Result<TokenResponse, Error> {
        if !request.valid() {
            return Err(ProtocolError::invalid_request("malformed token request").into());
        }

        let client_id = Credentials::from_request(request).authenticate(ctx.registrar)?;

        let code = request
            .parameter("code")
            .ok_or_else(|| ProtocolError::invalid_request("missing `code` parameter"))?;

        let payload = ctx
            .codec
            .unseal(&code, SealedKind::Code)
            .map_err(|_| ProtocolError::invalid_grant("authorization code is not valid"))?;

        if payload.client_id != client_id {
            return Err(ProtocolError::invalid_grant(
                "authorization code was issued to another client",
            )
            .into());
        }

        // The redirect uri of the authorization request must be repeated verbatim.
        match (&payload.redirect_uri, request.parameter("redirect_uri")) {
            (Some(bound), Some(given)) if bound.as_str() == given.as_ref() => {}
            (Some(_), _) => {
                return Err(ProtocolError::invalid_grant(
                    "redirect_uri does not match the authorization request",
                )
                .into())
            }
            (None, _) => {}
        }

        if payload.until < Utc::now() {
            return Err(ProtocolError::invalid_grant("authorization code expired").into());
        }

        let fresh = ctx
            .tokens
            .consume_once(&payload.handle_id)
            .map_err(Error::Repository)?;
        if !fresh {
            return Err(ProtocolError::invalid_grant("authorization code already redeemed").into());
        }

        let signed = ctx.issuer.issue(
            ctx.tokens,
            IssueParams {
                client_id: client_id.clone(),
                user_id: payload.user_id.clone(),
                scope: payload.scope.clone(),
                ttl: None,
            },
        )?;

        let refresh_token =
            issue_refresh_token(ctx, &client_id, payload.user_id.as_deref(), &payload.scope)?;

        Ok(TokenResponse {
            access_token: signed.token,
            token_type: "Bearer",
            expires_in: (signed.until - Utc::now()).num_seconds(),
            refresh_token,
            scope: Some(payload.scope.to_string()),
            id_token: None,
            user_id: payload.user_id,
        })
    }
}
