//! Server configuration: roles, endpoints and feature toggles.
use std::ops::BitOr;

use chrono::Duration;

use crate::grants::GrantTypeConfig;
use crate::keys::KeyConfig;

/// Which halves of the engine a deployment runs.
///
/// A bitmask: a process can be the authorization server, the resource server, or both (the
/// default). Accessing a façade of a role that is not enabled is an invalid call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerRole(u8);

impl ServerRole {
    /// Issues grants and tokens.
    pub const AUTHORIZATION_SERVER: ServerRole = ServerRole(0b01);

    /// Validates bearer tokens on protected requests.
    pub const RESOURCE_SERVER: ServerRole = ServerRole(0b10);

    /// Both roles in one process.
    pub const BOTH: ServerRole = ServerRole(0b11);

    /// Whether all roles of `other` are enabled.
    pub fn contains(&self, other: ServerRole) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ServerRole {
    fn default() -> Self {
        ServerRole::BOTH
    }
}

impl BitOr for ServerRole {
    type Output = ServerRole;

    fn bitor(self, rhs: ServerRole) -> ServerRole {
        ServerRole(self.0 | rhs.0)
    }
}

/// The relative paths of the protocol endpoints.
///
/// The engine does no routing; the embedding application mounts its handlers under these
/// paths, and the engine uses them to build redirect and discovery urls.
#[derive(Clone, Debug)]
pub struct EndpointPaths {
    /// The authorization endpoint.
    pub authorize: String,

    /// The token endpoint.
    pub token: String,

    /// The consent screen the user is sent to.
    pub authorize_client: String,

    /// The JWKS document.
    pub jwks: String,

    /// The OpenID Connect discovery document.
    pub openid_configuration: String,

    /// The OpenID Connect userinfo endpoint.
    pub userinfo: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        EndpointPaths {
            authorize: "oauth2/authorize".to_string(),
            token: "oauth2/access-token".to_string(),
            authorize_client: "oauth2/authorize-client".to_string(),
            jwks: "oauth2/certs".to_string(),
            openid_configuration: ".well-known/openid-configuration".to_string(),
            userinfo: "oauth2/oidc/userinfo".to_string(),
        }
    }
}

/// The complete configuration of a deployment.
pub struct ServerConfig {
    /// Enabled roles.
    pub server_role: ServerRole,

    /// Key material; which parts are required follows from the role.
    pub keys: KeyConfig,

    /// Enabled grant types of the authorization server.
    pub grant_types: Vec<GrantTypeConfig>,

    /// Issuer url, base of all endpoint urls and the `iss` claim.
    pub issuer_url: String,

    /// Endpoint paths relative to the issuer url.
    pub endpoints: EndpointPaths,

    /// Lifetime of issued access tokens.
    pub default_access_token_ttl: Duration,

    /// Lifetime of issued refresh tokens.
    pub refresh_token_ttl: Duration,

    /// Whether the resource server checks the revocation state of each token in the token
    /// store, on top of the signature and expiry checks.
    pub resource_server_access_token_revocation_validation: bool,

    /// Whether OpenID Connect features (id tokens, userinfo) are active.
    pub enable_openid_connect: bool,

    /// Whether the discovery document is served.
    pub enable_openid_connect_discovery: bool,

    /// Whether the discovery document lists the enabled grant types.
    pub openid_connect_discovery_include_supported_grant_types: bool,

    /// With OpenID Connect active, issue refresh tokens even without the `offline_access`
    /// scope.
    pub openid_connect_issue_refresh_token_without_offline_access_scope: bool,

    /// Release the detailed messages of internal errors in responses, through the façades'
    /// `public_error_message`. A development aid, off by default.
    pub display_confidential_exception_messages: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_role: ServerRole::default(),
            keys: KeyConfig::default(),
            grant_types: vec![],
            issuer_url: String::new(),
            endpoints: EndpointPaths::default(),
            default_access_token_ttl: Duration::hours(1),
            refresh_token_ttl: Duration::days(30),
            resource_server_access_token_revocation_validation: true,
            enable_openid_connect: false,
            enable_openid_connect_discovery: false,
            openid_connect_discovery_include_supported_grant_types: true,
            openid_connect_issue_refresh_token_without_offline_access_scope: false,
            display_confidential_exception_messages: false,
        }
    }
}

impl ServerConfig {
    /// An absolute url for one of the configured endpoint paths.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.issuer_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_combine_as_bitmask() {
        let role = ServerRole::AUTHORIZATION_SERVER | ServerRole::RESOURCE_SERVER;
        assert_eq!(role, ServerRole::BOTH);
        assert!(role.contains(ServerRole::AUTHORIZATION_SERVER));
        assert!(role.contains(ServerRole::RESOURCE_SERVER));
        assert!(!ServerRole::RESOURCE_SERVER.contains(ServerRole::AUTHORIZATION_SERVER));
        assert!(ServerRole::default().contains(ServerRole::RESOURCE_SERVER));
    }

    #[test]
    fn endpoint_urls_join_cleanly() {
        let config = ServerConfig {
            issuer_url: "https://auth.example/".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.endpoint_url(&config.endpoints.token),
            "https://auth.example/oauth2/access-token"
        );
    }
}
