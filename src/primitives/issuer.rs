//! Issuers create and validate the bearer tokens handed to clients.
//!
//! Access tokens are RS256 signed JWTs; their claims are self-describing so a resource server
//! can validate them with nothing but the public key. The [`TokenStore`] keeps the issuance
//! record per token id, which powers revocation checks and the single-use enforcement for
//! sealed handles.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolErrorKind, RepositoryError};
use crate::keys::KeySet;

use super::generator::random_id;
use super::scope::ScopeSet;

/// The claims carried in an access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    /// The issuer url of the authorization server.
    pub iss: String,

    /// The authenticated subject: the user, or the client itself for pure client grants.
    pub sub: String,

    /// The client the token was issued to.
    pub aud: String,

    /// Unique token id, checked against the revocation list.
    pub jti: String,

    /// Issued-at, seconds since the epoch.
    pub iat: i64,

    /// Expiry, seconds since the epoch.
    pub exp: i64,

    /// The client id, also available when `sub` names a user.
    pub client_id: String,

    /// Granted scopes in wire form.
    pub scope: String,
}

impl AccessClaims {
    /// The granted scopes as a set.
    pub fn scope_set(&self) -> ScopeSet {
        // The scope string was produced by this crate and parses by construction.
        self.scope.parse().unwrap_or_default()
    }

    /// The expiry as a timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

/// The issuance record kept per access token.
#[derive(Clone, Debug)]
pub struct TokenRecord {
    /// The token id (`jti` claim).
    pub token_id: String,

    /// The client the token was issued to.
    pub client_id: String,

    /// The user the token acts for, if any.
    pub user_id: Option<String>,

    /// The granted scopes.
    pub scope: ScopeSet,

    /// Expiry of the token.
    pub until: DateTime<Utc>,
}

/// Keeps issued tokens and answers revocation queries.
///
/// Implementations are shared between request handlers and use interior mutability; the
/// in-memory [`MemoryTokenStore`] wraps its maps in a mutex.
pub trait TokenStore: Send + Sync {
    /// Record a freshly issued token.
    fn save(&self, record: TokenRecord) -> Result<(), RepositoryError>;

    /// Whether the token id has been revoked (or was never issued here).
    fn is_revoked(&self, token_id: &str) -> Result<bool, RepositoryError>;

    /// Revoke a token id.
    fn revoke(&self, token_id: &str) -> Result<(), RepositoryError>;

    /// Mark a sealed handle id (code or refresh token) as used.
    ///
    /// Returns `true` exactly once per id; a second call means replay.
    fn consume_once(&self, handle_id: &str) -> Result<bool, RepositoryError>;
}

impl<T: TokenStore + ?Sized> TokenStore for Box<T> {
    fn save(&self, record: TokenRecord) -> Result<(), RepositoryError> {
        (**self).save(record)
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool, RepositoryError> {
        (**self).is_revoked(token_id)
    }

    fn revoke(&self, token_id: &str) -> Result<(), RepositoryError> {
        (**self).revoke(token_id)
    }

    fn consume_once(&self, handle_id: &str) -> Result<bool, RepositoryError> {
        (**self).consume_once(handle_id)
    }
}

impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    fn save(&self, record: TokenRecord) -> Result<(), RepositoryError> {
        (**self).save(record)
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool, RepositoryError> {
        (**self).is_revoked(token_id)
    }

    fn revoke(&self, token_id: &str) -> Result<(), RepositoryError> {
        (**self).revoke(token_id)
    }

    fn consume_once(&self, handle_id: &str) -> Result<bool, RepositoryError> {
        (**self).consume_once(handle_id)
    }
}

/// A simple in-memory token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    inner: Mutex<MemoryTokenStoreInner>,
}

#[derive(Default)]
struct MemoryTokenStoreInner {
    tokens: HashMap<String, TokenRecord>,
    revoked: HashSet<String>,
    consumed: HashSet<String>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> MemoryTokenStore {
        MemoryTokenStore::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, record: TokenRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        inner.tokens.insert(record.token_id.clone(), record);
        Ok(())
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool, RepositoryError> {
        let inner = self.inner.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(inner.revoked.contains(token_id) || !inner.tokens.contains_key(token_id))
    }

    fn revoke(&self, token_id: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        inner.revoked.insert(token_id.to_string());
        Ok(())
    }

    fn consume_once(&self, handle_id: &str) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().map_err(|_| RepositoryError::message("poisoned lock"))?;
        Ok(inner.consumed.insert(handle_id.to_string()))
    }
}

/// Parameters for one token issuance.
pub struct IssueParams {
    /// The client the token goes to.
    pub client_id: String,

    /// The user the token acts for, if any. Falls back to the client id as subject.
    pub user_id: Option<String>,

    /// The granted scopes.
    pub scope: ScopeSet,

    /// Validity duration; `None` uses the issuer default.
    pub ttl: Option<Duration>,
}

/// A signed access token together with its record data.
pub struct SignedToken {
    /// The compact JWT.
    pub token: String,

    /// The token id.
    pub token_id: String,

    /// Expiry of the token.
    pub until: DateTime<Utc>,
}

/// Signs access tokens and records them in a [`TokenStore`].
pub struct TokenIssuer {
    keys: Arc<KeySet>,
    issuer_url: String,
    default_ttl: Duration,
}

impl TokenIssuer {
    /// Create an issuer over the signing key set.
    pub fn new(keys: Arc<KeySet>, issuer_url: String, default_ttl: Duration) -> TokenIssuer {
        TokenIssuer {
            keys,
            issuer_url,
            default_ttl,
        }
    }

    /// The configured default token lifetime.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Sign a fresh access token and record it.
    pub fn issue(
        &self, store: &dyn TokenStore, params: IssueParams,
    ) -> Result<SignedToken, ProtocolError> {
        let signing = self.keys.signing_key().ok_or_else(|| {
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description("this deployment has no token signing key")
        })?;

        let now = Utc::now();
        let until = now + params.ttl.unwrap_or(self.default_ttl);
        let token_id = random_id();

        let claims = AccessClaims {
            iss: self.issuer_url.clone(),
            sub: params.user_id.clone().unwrap_or_else(|| params.client_id.clone()),
            aud: params.client_id.clone(),
            jti: token_id.clone(),
            iat: now.timestamp(),
            exp: until.timestamp(),
            client_id: params.client_id.clone(),
            scope: params.scope.to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.key_id().to_string());
        let token = encode(&header, &claims, signing).map_err(|err| {
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description(format!("token signing failed: {}", err))
        })?;

        store
            .save(TokenRecord {
                token_id: token_id.clone(),
                client_id: params.client_id,
                user_id: params.user_id,
                scope: params.scope,
                until,
            })
            .map_err(|err| {
                ProtocolError::new(ProtocolErrorKind::ServerError)
                    .with_description(format!("could not record token: {}", err))
            })?;

        Ok(SignedToken {
            token,
            token_id,
            until,
        })
    }
}
