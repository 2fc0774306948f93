//! Grant types: the pluggable handlers behind the token endpoint.
//!
//! Each [`GrantType`] owns one `grant_type` value of the token request. The built-in handlers
//! cover the authorization code grant (with consent), the client credentials grant (with the
//! default-user extension) and refresh tokens. Custom grants implement the trait and are
//! registered through [`GrantTypeConfig`], which also accepts the built-ins by name or numeric
//! shorthand so a configuration file can enable them without constructing anything.
use std::borrow::Cow;

use chrono::Duration;
use serde::Serialize;

use crate::error::{ConfigError, Error, ProtocolError, ProtocolErrorKind};
use crate::primitives::approvals::ApprovalStore;
use crate::primitives::issuer::{TokenIssuer, TokenStore};
use crate::primitives::registrar::{Registrar, RegistrarError};
use crate::primitives::scope::ScopeSet;
use crate::primitives::sealed::SealedCodec;
use crate::primitives::users::UserStore;

pub mod authorization_code;
pub mod client_credentials;
pub mod refresh;

pub use authorization_code::AuthorizationCodeGrant;
pub use client_credentials::ClientCredentialsGrant;
pub use refresh::RefreshTokenGrant;

/// Wire identifier of the authorization code grant.
pub const AUTHORIZATION_CODE: &str = "authorization_code";
/// Wire identifier of the client credentials grant.
pub const CLIENT_CREDENTIALS: &str = "client_credentials";
/// Wire identifier of the refresh token grant.
pub const REFRESH_TOKEN: &str = "refresh_token";

/// When a grant hands out refresh tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshRule {
    /// Refresh tokens accompany every eligible grant.
    Always,

    /// Only grants carrying the `offline_access` scope get one (OpenID Connect default).
    RequireOfflineAccess,
}

impl RefreshRule {
    /// Whether a grant over the given scopes gets a refresh token.
    pub fn allows(&self, scope: &ScopeSet) -> bool {
        match self {
            RefreshRule::Always => true,
            RefreshRule::RequireOfflineAccess => scope.contains("offline_access"),
        }
    }
}

/// The collaborators a grant type works with, borrowed from the authorization server for the
/// duration of one token request.
pub struct GrantContext<'a> {
    /// Client registry.
    pub registrar: &'a dyn Registrar,

    /// Issued-token records, revocation and single-use enforcement.
    pub tokens: &'a dyn TokenStore,

    /// Access token signer.
    pub issuer: &'a TokenIssuer,

    /// Codec for sealed codes and refresh tokens.
    pub codec: &'a SealedCodec,

    /// Consent history.
    pub approvals: &'a dyn ApprovalStore,

    /// User identity lookup.
    pub users: &'a dyn UserStore,

    /// Lifetime of issued refresh tokens.
    pub refresh_ttl: Duration,

    /// Refresh token policy in effect.
    pub refresh_rule: RefreshRule,
}

/// The parameters of a token endpoint request, supplied by the embedding application.
pub trait TokenRequest {
    /// Whether the request is syntactically valid (parseable body, no repeated parameters).
    /// An invalid request fails early with `invalid_request`.
    fn valid(&self) -> bool;

    /// The client credentials from the `Authorization` header, if the header is present.
    fn authorization(&self) -> Option<(Cow<str>, Cow<[u8]>)>;

    /// The `grant_type` body parameter.
    fn grant_type(&self) -> Option<Cow<str>>;

    /// An arbitrary body parameter (`code`, `scope`, `refresh_token`, `client_id`, ...).
    fn parameter(&self, key: &str) -> Option<Cow<str>>;
}

/// The client authentication found in a token request.
///
/// Collects the header and body variants and detects the duplicate-credentials case the rfc
/// requires to be rejected.
pub enum Credentials<'a> {
    /// No credentials were offered.
    None,

    /// Only a client id was offered, a public client.
    Unauthenticated {
        /// The client id from the request body.
        client_id: Cow<'a, str>,
    },

    /// A client id and passphrase were offered.
    Authenticated {
        /// The client id.
        client_id: Cow<'a, str>,

        /// The passphrase to check.
        passphrase: Cow<'a, [u8]>,
    },

    /// More than one mechanism was used, must be rejected.
    Duplicate,
}

impl<'a> Credentials<'a> {
    /// Gather the credentials from a request.
    pub fn from_request(request: &'a dyn TokenRequest) -> Credentials<'a> {
        let mut credentials = Credentials::None;
        if let Some((client_id, passphrase)) = request.authorization() {
            credentials = credentials.add_authenticated(client_id, passphrase);
        }
        match (request.parameter("client_id"), request.parameter("client_secret")) {
            (Some(client_id), Some(secret)) => {
                credentials = credentials
                    .add_authenticated(client_id, Cow::Owned(secret.into_owned().into_bytes()));
            }
            (Some(client_id), None) => {
                credentials = credentials.add_unauthenticated(client_id);
            }
            (None, _) => {}
        }
        credentials
    }

    fn add_authenticated(self, client_id: Cow<'a, str>, passphrase: Cow<'a, [u8]>) -> Self {
        match self {
            Credentials::None => Credentials::Authenticated {
                client_id,
                passphrase,
            },
            _ => Credentials::Duplicate,
        }
    }

    fn add_unauthenticated(self, client_id: Cow<'a, str>) -> Self {
        match self {
            Credentials::None => Credentials::Unauthenticated { client_id },
            _ => Credentials::Duplicate,
        }
    }

    /// Authenticate against the registrar, yielding the verified client id.
    ///
    /// Public clients pass with just their id, confidential clients need their passphrase.
    pub fn authenticate(self, registrar: &dyn Registrar) -> Result<String, ProtocolError> {
        let (client_id, passphrase) = match self {
            Credentials::None => {
                return Err(ProtocolError::invalid_client("no client authentication provided"))
            }
            Credentials::Duplicate => {
                return Err(ProtocolError::invalid_request(
                    "client authentication provided through more than one mechanism",
                ))
            }
            Credentials::Unauthenticated { client_id } => (client_id, None),
            Credentials::Authenticated {
                client_id,
                passphrase,
            } => (client_id, Some(passphrase)),
        };

        registrar
            .check(&client_id, passphrase.as_deref())
            .map_err(|err| match err {
                RegistrarError::Unspecified => {
                    ProtocolError::invalid_client("client authentication failed")
                }
                RegistrarError::PrimitiveError => {
                    ProtocolError::new(ProtocolErrorKind::ServerError)
                        .with_description("client registry failure")
                }
            })?;

        Ok(client_id.into_owned())
    }
}

/// The body of a successful token response, rfc6749 §5.1.
#[derive(Clone, Debug, Serialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,

    /// Always `Bearer`.
    pub token_type: &'static str,

    /// Lifetime in seconds.
    pub expires_in: i64,

    /// The refresh token, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// The granted scope in wire form. Present whenever it differs from the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// The OpenID Connect id token, attached by the server when the grant carries `openid`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// The subject the grant acts for. Not serialized; feeds the id token enhancer.
    #[serde(skip)]
    pub user_id: Option<String>,
}

impl TokenResponse {
    /// Serialize to the json body.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("token response serializes")
    }
}

/// A handler for one `grant_type`.
pub trait GrantType: Send + Sync {
    /// The `grant_type` value this handler owns.
    fn identifier(&self) -> &str;

    /// Handle a token request that carried this handler's grant type.
    fn respond(&self, ctx: &GrantContext, request: &dyn TokenRequest) -> Result<TokenResponse, Error>;
}

/// Declarative grant type configuration.
///
/// Mirrors the polymorphism of typical server configuration: hand over a ready instance, a
/// nested list, the name or numeric shorthand of a built-in, or a callback that registers
/// grants programmatically.
pub enum GrantTypeConfig {
    /// A ready handler instance.
    Instance(Box<dyn GrantType>),

    /// A nested list, flattened in order.
    List(Vec<GrantTypeConfig>),

    /// The name of a built-in handler with default settings.
    Name(String),

    /// The numeric shorthand of a built-in handler:
    /// 1 = authorization_code, 2 = client_credentials, 3 = refresh_token.
    Builtin(u8),

    /// A callback that registers handlers itself.
    Callback(fn(&mut GrantRegistry) -> Result<(), ConfigError>),
}

/// The resolved, enabled grant handlers of an authorization server.
#[derive(Default)]
pub struct GrantRegistry {
    grants: Vec<Box<dyn GrantType>>,
}

impl GrantRegistry {
    /// Resolve a configuration into concrete handlers.
    ///
    /// Unknown names or numbers fail with [`ConfigError::UnknownGrantType`] naming the value.
    pub fn resolve(configs: Vec<GrantTypeConfig>) -> Result<GrantRegistry, ConfigError> {
        let mut registry = GrantRegistry::default();
        registry.apply_all(configs)?;
        Ok(registry)
    }

    fn apply_all(&mut self, configs: Vec<GrantTypeConfig>) -> Result<(), ConfigError> {
        for config in configs {
            self.apply(config)?;
        }
        Ok(())
    }

    fn apply(&mut self, config: GrantTypeConfig) -> Result<(), ConfigError> {
        match config {
            GrantTypeConfig::Instance(grant) => self.register(grant),
            GrantTypeConfig::List(list) => self.apply_all(list)?,
            GrantTypeConfig::Name(name) => {
                let grant = Self::builtin_by_name(&name)
                    .ok_or(ConfigError::UnknownGrantType(name))?;
                self.register(grant);
            }
            GrantTypeConfig::Builtin(number) => {
                let grant = Self::builtin_by_number(number)
                    .ok_or_else(|| ConfigError::UnknownGrantType(number.to_string()))?;
                self.register(grant);
            }
            GrantTypeConfig::Callback(callback) => callback(self)?,
        }
        Ok(())
    }

    /// Register a handler, replacing a previous one for the same identifier.
    pub fn register(&mut self, grant: Box<dyn GrantType>) {
        self.grants
            .retain(|existing| existing.identifier() != grant.identifier());
        self.grants.push(grant);
    }

    /// The handler for a grant type, if enabled.
    pub fn find(&self, grant_type: &str) -> Option<&dyn GrantType> {
        self.grants
            .iter()
            .find(|grant| grant.identifier() == grant_type)
            .map(|grant| &**grant)
    }

    /// The enabled grant type identifiers, in registration order.
    pub fn identifiers(&self) -> Vec<&str> {
        self.grants.iter().map(|grant| grant.identifier()).collect()
    }

    fn builtin_by_name(name: &str) -> Option<Box<dyn GrantType>> {
        match name {
            AUTHORIZATION_CODE => Some(Box::new(AuthorizationCodeGrant::default())),
            CLIENT_CREDENTIALS => Some(Box::new(ClientCredentialsGrant::default())),
            REFRESH_TOKEN => Some(Box::new(RefreshTokenGrant::default())),
            _ => None,
        }
    }

    fn builtin_by_number(number: u8) -> Option<Box<dyn GrantType>> {
        match number {
            1 => Self::builtin_by_name(AUTHORIZATION_CODE),
            2 => Self::builtin_by_name(CLIENT_CREDENTIALS),
            3 => Self::builtin_by_name(REFRESH_TOKEN),
            _ => None,
        }
    }

}

/// Seal a fresh refresh token for the grant, respecting the refresh rule in effect.
pub(crate) fn issue_refresh_token(
    ctx: &GrantContext, client_id: &str, user_id: Option<&str>, scope: &ScopeSet,
) -> Result<Option<String>, Error> {
    if !ctx.refresh_rule.allows(scope) {
        return Ok(None);
    }
    let payload = crate::primitives::sealed::SealedPayload {
        kind: crate::primitives::sealed::SealedKind::Refresh,
        handle_id: crate::primitives::generator::random_id(),
        client_id: client_id.to_string(),
        user_id: user_id.map(str::to_string),
        scope: scope.clone(),
        redirect_uri: None,
        until: chrono::Utc::now() + ctx.refresh_ttl,
    };
    let sealed = ctx.codec.seal(&payload).map_err(|_| {
        Error::Protocol(
            ProtocolError::new(ProtocolErrorKind::ServerError)
                .with_description("could not seal refresh token"),
        )
    })?;
    Ok(Some(sealed))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) mod harness {
        use std::borrow::Cow;
        use std::collections::HashMap;

        use chrono::{Duration, Utc};

        use crate::error::Error;
        use crate::grants::{GrantContext, RefreshRule, TokenRequest};
        use crate::primitives::approvals::{ApprovalStore, MemoryApprovals};
        use crate::primitives::generator::random_id;
        use crate::primitives::issuer::{MemoryTokenStore, TokenIssuer};
        use crate::primitives::registrar::{Client, ClientMap};
        use crate::primitives::scope::{ScopeEntry, ScopeSet};
        use crate::primitives::sealed::{SealedCodec, SealedKind, SealedPayload};
        use crate::primitives::users::{MemoryUsers, UserRecord};

        /// A token request assembled from literal parameters.
        pub struct CraftedTokenRequest {
            params: HashMap<String, String>,
        }

        impl TokenRequest for CraftedTokenRequest {
            fn valid(&self) -> bool {
                true
            }

            fn authorization(&self) -> Option<(Cow<str>, Cow<[u8]>)> {
                None
            }

            fn grant_type(&self) -> Option<Cow<str>> {
                self.parameter("grant_type")
            }

            fn parameter(&self, key: &str) -> Option<Cow<str>> {
                self.params.get(key).map(|value| Cow::Borrowed(value.as_str()))
            }
        }

        /// Assemble a request from key-value pairs.
        pub fn request_with(params: &[(&str, &str)]) -> CraftedTokenRequest {
            CraftedTokenRequest {
                params: params
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            }
        }

        /// A complete set of collaborators for driving grants in tests.
        pub struct Harness {
            pub registrar: ClientMap,
            pub tokens: MemoryTokenStore,
            pub issuer: TokenIssuer,
            pub codec: SealedCodec,
            pub approvals: MemoryApprovals,
            pub users: MemoryUsers,
        }

        impl Harness {
            pub const CONFIDENTIAL_CLIENT: &'static str = "ConfidentialClient";
            pub const PUBLIC_CLIENT: &'static str = "PublicClient";
            pub const MACHINE_CLIENT: &'static str = "MachineClient";
            pub const CLIENT_SECRET: &'static str = "WOJJCcS8WyS2aGmJK6ZADg==";
            pub const REDIRECT_URI: &'static str = "https://client.example/redirect";
            pub const DEFAULT_USER: &'static str = "service-account";

            pub fn new() -> Harness {
                let scopes = || {
                    vec![
                        ScopeEntry::required("email".parse().unwrap()),
                        ScopeEntry::required("profile".parse().unwrap()),
                        ScopeEntry::automatic("openid".parse().unwrap()),
                    ]
                };

                let mut registrar = ClientMap::new();
                registrar.register_client(
                    Client::confidential(
                        Self::CONFIDENTIAL_CLIENT,
                        Self::REDIRECT_URI.parse().unwrap(),
                        Self::CLIENT_SECRET.as_bytes(),
                    )
                    .with_scopes(scopes()),
                );
                registrar.register_client(
                    Client::public(Self::PUBLIC_CLIENT, Self::REDIRECT_URI.parse().unwrap())
                        .with_scopes(scopes()),
                );
                registrar.register_client(
                    Client::confidential(
                        Self::MACHINE_CLIENT,
                        Self::REDIRECT_URI.parse().unwrap(),
                        Self::CLIENT_SECRET.as_bytes(),
                    )
                    .with_scopes(scopes())
                    .with_default_grant_user(Self::DEFAULT_USER),
                );

                let users = MemoryUsers::new();
                users.add_user(UserRecord::new("alice"));
                users.add_user(UserRecord::new(Self::DEFAULT_USER));

                Harness {
                    registrar,
                    tokens: MemoryTokenStore::new(),
                    issuer: crate::primitives::issuer::tests::test_issuer(),
                    codec: SealedCodec::new(&[7u8; 32]),
                    approvals: MemoryApprovals::new(),
                    users,
                }
            }

            /// Run a closure with a borrowed grant context.
            pub fn with_ctx<T>(
                &self, run: impl FnOnce(&GrantContext) -> Result<T, Error>,
            ) -> Result<T, Error> {
                run(&GrantContext {
                    registrar: &self.registrar,
                    tokens: &self.tokens,
                    issuer: &self.issuer,
                    codec: &self.codec,
                    approvals: &self.approvals,
                    users: &self.users,
                    refresh_ttl: Duration::days(30),
                    refresh_rule: RefreshRule::Always,
                })
            }

            /// A valid authorization code for the confidential client.
            pub fn fresh_code(&self, user: &str, scope: &str) -> String {
                crate::grants::authorization_code::seal_authorization_code(
                    &self.codec,
                    Self::CONFIDENTIAL_CLIENT,
                    user,
                    &scope.parse().unwrap(),
                    &Self::REDIRECT_URI.parse().unwrap(),
                )
                .unwrap()
            }

            /// A valid refresh token for the confidential client.
            pub fn fresh_refresh_token(&self, user: &str, scope: &str) -> String {
                self.codec
                    .seal(&SealedPayload {
                        kind: SealedKind::Refresh,
                        handle_id: random_id(),
                        client_id: Self::CONFIDENTIAL_CLIENT.to_string(),
                        user_id: Some(user.to_string()),
                        scope: scope.parse().unwrap(),
                        redirect_uri: None,
                        until: Utc::now() + Duration::days(30),
                    })
                    .unwrap()
            }

            /// Record prior consent of the default grant user for the machine client.
            pub fn approve_for_default_user(&self, scope: &str) {
                self.approvals
                    .record_decision(
                        Self::DEFAULT_USER,
                        Self::MACHINE_CLIENT,
                        &scope.parse().unwrap(),
                        &ScopeSet::new(),
                    )
                    .unwrap();
            }
        }
    }

    struct NamedGrant(&'static str);

    impl GrantType for NamedGrant {
        fn identifier(&self) -> &str {
            self.0
        }

        fn respond(&self, _: &GrantContext, _: &dyn TokenRequest) -> Result<TokenResponse, Error> {
            unimplemented!("registration tests never dispatch")
        }
    }

    #[test]
    fn registration_polymorphism() {
        let registry = GrantRegistry::resolve(vec![
            GrantTypeConfig::Name(AUTHORIZATION_CODE.to_string()),
            GrantTypeConfig::List(vec![GrantTypeConfig::Builtin(3)]),
            GrantTypeConfig::Instance(Box::new(NamedGrant("urn:example:custom"))),
            GrantTypeConfig::Callback(|registry| {
                registry.register(Box::new(ClientCredentialsGrant::default()));
                Ok(())
            }),
        ])
        .unwrap();

        assert_eq!(
            registry.identifiers(),
            vec![AUTHORIZATION_CODE, REFRESH_TOKEN, "urn:example:custom", CLIENT_CREDENTIALS]
        );
        assert!(registry.find(AUTHORIZATION_CODE).is_some());
        assert!(registry.find("password").is_none());
    }

    #[test]
    fn unknown_grant_types_fail_by_value() {
        match GrantRegistry::resolve(vec![GrantTypeConfig::Name("implicit".to_string())]) {
            Err(ConfigError::UnknownGrantType(name)) => assert_eq!(name, "implicit"),
            other => panic!("expected UnknownGrantType, got {:?}", other.err()),
        }
        assert!(matches!(
            GrantRegistry::resolve(vec![GrantTypeConfig::Builtin(9)]),
            Err(ConfigError::UnknownGrantType(value)) if value == "9"
        ));
    }

    #[test]
    fn later_registrations_replace_earlier_ones() {
        let mut registry = GrantRegistry::default();
        registry.register(Box::new(NamedGrant(AUTHORIZATION_CODE)));
        registry.register(Box::new(AuthorizationCodeGrant::default()));
        assert_eq!(registry.identifiers().len(), 1);
    }

    #[test]
    fn refresh_rule() {
        let with: ScopeSet = "email offline_access".parse().unwrap();
        let without: ScopeSet = "email".parse().unwrap();
        assert!(RefreshRule::Always.allows(&without));
        assert!(RefreshRule::RequireOfflineAccess.allows(&with));
        assert!(!RefreshRule::RequireOfflineAccess.allows(&without));
    }
}
