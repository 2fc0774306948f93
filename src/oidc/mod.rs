//! OpenID Connect on top of the OAuth2 core: id tokens, userinfo and discovery.
//!
//! The OAuth2 side of the engine works without this module; the authorization server only
//! consults it when OpenID Connect is enabled and a grant carries the `openid` scope.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ProtocolError, ProtocolErrorKind};
use crate::grants;
use crate::keys::KeySet;
use crate::primitives::scope::ScopeSet;
use crate::primitives::users::UserRecord;
use crate::server::ServerConfig;

pub mod claims;

pub use claims::{ClaimSource, ClaimsConfigItem, KeyedClaimValue, OidcClaim, ScopeClaims};

#[derive(Serialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_time: Option<i64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// Signs id tokens for grants carrying the `openid` scope.
pub struct IdTokenIssuer {
    keys: Arc<KeySet>,
    issuer_url: String,
    ttl: Duration,
    claims: ScopeClaims,
}

impl IdTokenIssuer {
    /// An issuer with the standard scope-to-claims mapping.
    pub fn new(keys: Arc<KeySet>, issuer_url: String, ttl: Duration) -> IdTokenIssuer {
        IdTokenIssuer {
            keys,
            issuer_url,
            ttl,
            claims: ScopeClaims::standard(),
        }
    }

    /// Replace the scope-to-claims mapping.
    pub fn with_claims(mut self, claims: ScopeClaims) -> Self {
        self.claims = claims;
        self
    }

    /// The mapping in use, shared with the userinfo endpoint.
    pub fn claims(&self) -> &ScopeClaims {
        &self.claims
    }

    /// Sign an id token for a user, releasing the claims the granted scopes allow.
    pub fn issue(
        &self, client_id: &str, user: &UserRecord, granted: &ScopeSet,
        auth_time: Option<DateTime<Utc>>,
    ) -> Result<String, ProtocolError> {
        let signing = self.keys.signing_key().ok_or_else(|| {
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description("this deployment has no token signing key")
        })?;

        let now = Utc::now();
        let token_claims = IdTokenClaims {
            iss: self.issuer_url.clone(),
            sub: user.identifier.clone(),
            aud: client_id.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
            auth_time: auth_time.map(|time| time.timestamp()),
            extra: self.claims.collect(user, granted),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.key_id().to_string());
        encode(&header, &token_claims, signing).map_err(|err| {
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description(format!("id token signing failed: {}", err))
        })
    }
}

/// The userinfo response body for a validated bearer token.
///
/// Always carries `sub`; everything else follows the granted scopes and the user's attributes.
pub fn userinfo(user: &UserRecord, granted: &ScopeSet, claims: &ScopeClaims) -> Value {
    let mut body = claims.collect(user, granted);
    body.insert("sub".to_string(), json!(user.identifier));
    Value::Object(body)
}

/// The discovery document for the `.well-known/openid-configuration` endpoint.
///
/// `grant_types` lists the enabled grant type identifiers; pass `None` when the deployment
/// opted out of advertising them.
pub fn discovery_document(config: &ServerConfig, grant_types: Option<&[&str]>) -> Value {
    let mut document = json!({
        "issuer": config.issuer_url.trim_end_matches('/'),
        "authorization_endpoint": config.endpoint_url(&config.endpoints.authorize),
        "token_endpoint": config.endpoint_url(&config.endpoints.token),
        "userinfo_endpoint": config.endpoint_url(&config.endpoints.userinfo),
        "jwks_uri": config.endpoint_url(&config.endpoints.jwks),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": ["openid", "profile", "email", "address", "phone", "offline_access"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
        "claims_supported": ["iss", "sub", "aud", "exp", "iat", "auth_time"],
    });
    if let Some(grant_types) = grant_types {
        document["grant_types_supported"] = json!(grant_types);
    }
    document
}

/// Whether a refresh token may accompany an OpenID Connect grant with these scopes.
///
/// Core §11: without `offline_access` the client only gets tokens for the current session,
/// unless the deployment opted out of that rule.
pub fn refresh_rule_for(config: &ServerConfig) -> grants::RefreshRule {
    if config.enable_openid_connect
        && !config.openid_connect_issue_refresh_token_without_offline_access_scope
    {
        grants::RefreshRule::RequireOfflineAccess
    } else {
        grants::RefreshRule::Always
    }
}
