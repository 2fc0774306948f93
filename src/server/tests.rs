use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use url::Url;

use crate::consent::{ConsentStage, MemorySession};
use crate::error::{ConfigError, Error, ProtocolError, ProtocolErrorKind, ServerError};
use crate::grants::tests::harness::request_with;
use crate::grants::{GrantTypeConfig, TokenResponse};
use crate::keys::tests::test_config;
use crate::primitives::approvals::{ApprovalStore, MemoryApprovals};
use crate::primitives::issuer::{MemoryTokenStore, TokenStore};
use crate::primitives::registrar::{Client, ClientMap};
use crate::primitives::scope::ScopeEntry;
use crate::primitives::users::{MemoryUsers, UserRecord, UserStore};

use super::*;

const CONSENT_CLIENT: &str = "webshop";
const FIRST_PARTY_CLIENT: &str = "trusted-app";
const MACHINE_CLIENT: &str = "machine";
const CLIENT_SECRET: &str = "WOJJCcS8WyS2aGmJK6ZADg==";
const REDIRECT_URI: &str = "https://client.example/cb";

struct CraftedAuthorizeRequest {
    params: HashMap<String, String>,
}

impl AuthorizeRequest for CraftedAuthorizeRequest {
    fn valid(&self) -> bool {
        true
    }

    fn client_id(&self) -> Option<Cow<str>> {
        self.param("client_id")
    }

    fn redirect_uri(&self) -> Option<Cow<str>> {
        self.param("redirect_uri")
    }

    fn scope(&self) -> Option<Cow<str>> {
        self.param("scope")
    }

    fn state(&self) -> Option<Cow<str>> {
        self.param("state")
    }

    fn response_type(&self) -> Option<Cow<str>> {
        self.param("response_type")
    }
}

impl CraftedAuthorizeRequest {
    fn param(&self, key: &str) -> Option<Cow<str>> {
        self.params.get(key).map(|value| Cow::Borrowed(value.as_str()))
    }
}

fn authorize_request(client_id: &str, scope: &str) -> CraftedAuthorizeRequest {
    let params = [
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", REDIRECT_URI),
        ("scope", scope),
        ("state", "opaque-state"),
    ];
    CraftedAuthorizeRequest {
        params: params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

struct BearerRequest(Option<String>);

impl ProtectedRequest for BearerRequest {
    fn authorization(&self) -> Option<Cow<str>> {
        self.0.as_deref().map(Cow::Borrowed)
    }
}

fn bearer(token: &str) -> BearerRequest {
    BearerRequest(Some(format!("Bearer {}", token)))
}

fn config() -> ServerConfig {
    ServerConfig {
        keys: test_config(),
        grant_types: vec![
            GrantTypeConfig::Builtin(1),
            GrantTypeConfig::Builtin(2),
            GrantTypeConfig::Builtin(3),
        ],
        issuer_url: "https://auth.example".to_string(),
        ..ServerConfig::default()
    }
}

fn registrar() -> ClientMap {
    let scopes = || {
        vec![
            ScopeEntry::required("email".parse().unwrap()),
            ScopeEntry::required("profile".parse().unwrap()),
            ScopeEntry::required("offline_access".parse().unwrap()),
            ScopeEntry::automatic("openid".parse().unwrap()),
        ]
    };

    let mut registrar = ClientMap::new();
    registrar.register_client(
        Client::public(CONSENT_CLIENT, REDIRECT_URI.parse().unwrap()).with_scopes(scopes()),
    );
    registrar.register_client(
        Client::public(FIRST_PARTY_CLIENT, REDIRECT_URI.parse().unwrap())
            .with_scopes(scopes())
            .without_user_authorization(),
    );
    registrar.register_client(
        Client::confidential(
            MACHINE_CLIENT,
            REDIRECT_URI.parse().unwrap(),
            CLIENT_SECRET.as_bytes(),
        )
        .with_scopes(scopes()),
    );
    registrar
}

fn users() -> MemoryUsers {
    let users = MemoryUsers::new();
    users.add_user(
        UserRecord::new("alice")
            .with_claim("email", serde_json::json!("alice@example.com"))
            .with_claim("name", serde_json::json!("Alice Adams")),
    );
    users
}

struct Deployment {
    server: AuthorizationServer,
    tokens: Arc<MemoryTokenStore>,
    approvals: Arc<MemoryApprovals>,
    session: MemorySession,
}

impl Deployment {
    fn new() -> Deployment {
        Deployment::with_config(config())
    }

    fn with_config(config: ServerConfig) -> Deployment {
        let tokens = Arc::new(MemoryTokenStore::new());
        let approvals = Arc::new(MemoryApprovals::new());
        let server = AuthorizationServer::new(
            config,
            Collaborators {
                registrar: Box::new(registrar()),
                tokens: Box::new(Arc::clone(&tokens)),
                approvals: Box::new(Arc::clone(&approvals)),
                users: Box::new(users()),
            },
        )
        .unwrap();
        Deployment {
            server,
            tokens,
            approvals,
            session: MemorySession::new(),
        }
    }

    fn resource(&self) -> ResourceServer {
        ResourceServer::new(&config(), Some(Box::new(Arc::clone(&self.tokens)))).unwrap()
    }

    /// Drive a consent interaction: approve every pending scope and resume.
    fn approve_and_resume(&self, request_id: &str) -> Url {
        let mut request = self
            .server
            .load_authorization_request(&self.session, request_id)
            .unwrap()
            .unwrap();
        for scope in request.pending_scopes().iter() {
            request.approve_scope(scope.as_str()).unwrap();
        }
        request.process_authorization(true).unwrap();
        self.server
            .store_authorization_request(&self.session, &request)
            .unwrap();
        self.server.resume_authorization(request_id, &self.session).unwrap()
    }

    fn exchange_code(&self, code: &str, client_id: &str) -> TokenResponse {
        let request = request_with(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", client_id),
        ]);
        self.server.issue_token_response(&request).unwrap()
    }
}

fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

#[test]
fn full_flow_with_consent() {
    let deployment = Deployment::new();

    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email profile"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();

    let request_id = match outcome {
        AuthorizeOutcome::Consent {
            request_id,
            location,
        } => {
            assert_eq!(
                query(&location, "clientAuthorizationRequestId").as_deref(),
                Some(request_id.as_str())
            );
            assert!(location.as_str().starts_with("https://auth.example/oauth2/authorize-client"));
            request_id
        }
        other => panic!("expected a consent hop, got {:?}", other),
    };

    let redirect = deployment.approve_and_resume(&request_id);
    assert!(redirect.as_str().starts_with(REDIRECT_URI));
    assert_eq!(query(&redirect, "state").as_deref(), Some("opaque-state"));
    let code = query(&redirect, "code").expect("redirect carries a code");

    // The decision is in the approval store now.
    assert!(deployment.approvals.has_client_approval("alice", CONSENT_CLIENT).unwrap());
    assert!(deployment
        .approvals
        .approved_scopes("alice", CONSENT_CLIENT)
        .unwrap()
        .contains("email"));

    // The stored interaction is gone; resuming again restarts the flow.
    match deployment.server.resume_authorization(&request_id, &deployment.session) {
        Err(Error::Protocol(err)) => assert_eq!(err.kind(), ProtocolErrorKind::InvalidRequest),
        other => panic!("expected invalid_request, got {:?}", other.map(|_| ())),
    }

    let response = deployment.exchange_code(&code, CONSENT_CLIENT);
    assert_eq!(response.token_type, "Bearer");

    let auth = deployment
        .resource()
        .validate_authenticated_request(&bearer(&response.access_token))
        .unwrap();
    assert_eq!(auth.user_id(), Some("alice"));
    assert_eq!(auth.client_id(), CONSENT_CLIENT);
    assert!(auth.scopes().contains("email"));
    assert!(auth.scopes().contains("openid"));
    auth.require_scope("email").unwrap();
    assert!(auth.require_scope("admin").is_err());
}

#[test]
fn denied_consent_redirects_with_access_denied() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let request_id = match outcome {
        AuthorizeOutcome::Consent { request_id, .. } => request_id,
        other => panic!("expected a consent hop, got {:?}", other),
    };

    let mut request = deployment
        .server
        .load_authorization_request(&deployment.session, &request_id)
        .unwrap()
        .unwrap();
    request.process_authorization(false).unwrap();
    deployment
        .server
        .store_authorization_request(&deployment.session, &request)
        .unwrap();

    let redirect = deployment
        .server
        .resume_authorization(&request_id, &deployment.session)
        .unwrap();
    assert_eq!(query(&redirect, "error").as_deref(), Some("access_denied"));
    assert_eq!(query(&redirect, "state").as_deref(), Some("opaque-state"));
    assert!(query(&redirect, "code").is_none());
    assert!(!deployment.approvals.has_client_approval("alice", CONSENT_CLIENT).unwrap());
}

#[test]
fn first_party_clients_skip_consent() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(FIRST_PARTY_CLIENT, "email profile"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();

    let redirect = match outcome {
        AuthorizeOutcome::Redirect(url) => url,
        other => panic!("expected an immediate redirect, got {:?}", other),
    };
    let code = query(&redirect, "code").unwrap();
    let response = deployment.exchange_code(&code, FIRST_PARTY_CLIENT);
    assert!(response.scope.as_deref().unwrap().contains("profile"));
}

#[test]
fn previously_approved_requests_skip_consent() {
    let deployment = Deployment::new();
    deployment
        .approvals
        .record_decision(
            "alice",
            CONSENT_CLIENT,
            &"email profile".parse().unwrap(),
            &Default::default(),
        )
        .unwrap();

    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    match outcome {
        AuthorizeOutcome::Redirect(url) => assert!(query(&url, "code").is_some()),
        other => panic!("expected an immediate redirect, got {:?}", other),
    }
}

#[test]
fn denied_scopes_are_asked_again_on_later_requests() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email profile"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let request_id = match outcome {
        AuthorizeOutcome::Consent { request_id, .. } => request_id,
        other => panic!("expected a consent hop, got {:?}", other),
    };

    let mut request = deployment
        .server
        .load_authorization_request(&deployment.session, &request_id)
        .unwrap()
        .unwrap();
    request.approve_scope("email").unwrap();
    request.deny_scope("profile").unwrap();
    request.process_authorization(true).unwrap();
    deployment
        .server
        .store_authorization_request(&deployment.session, &request)
        .unwrap();
    let redirect = deployment
        .server
        .resume_authorization(&request_id, &deployment.session)
        .unwrap();
    assert!(query(&redirect, "code").is_some());

    // The denial only revoked the approval; it is not held against the next request.
    let approved = deployment.approvals.approved_scopes("alice", CONSENT_CLIENT).unwrap();
    assert!(approved.contains("email"));
    assert!(!approved.contains("profile"));

    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email profile"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let request_id = match outcome {
        AuthorizeOutcome::Consent { request_id, .. } => request_id,
        other => panic!("expected a consent hop, got {:?}", other),
    };
    let request = deployment
        .server
        .load_authorization_request(&deployment.session, &request_id)
        .unwrap()
        .unwrap();
    assert_eq!(request.pending_scopes().to_string(), "profile");
}

#[test]
fn anonymous_requests_await_authentication() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email"),
            &deployment.session,
            None,
        )
        .unwrap();
    let request_id = match outcome {
        AuthorizeOutcome::Consent { request_id, .. } => request_id,
        other => panic!("expected a consent hop, got {:?}", other),
    };
    let request = deployment
        .server
        .load_authorization_request(&deployment.session, &request_id)
        .unwrap()
        .unwrap();
    assert_eq!(request.stage(), ConsentStage::AwaitingAuthentication);
}

#[test]
fn unsupported_response_types_redirect_the_error() {
    let deployment = Deployment::new();
    let mut request = authorize_request(CONSENT_CLIENT, "email");
    request.params.insert("response_type".to_string(), "token".to_string());

    let outcome = deployment
        .server
        .issue_authorization_response(&request, &deployment.session, Some("alice"))
        .unwrap();
    match outcome {
        AuthorizeOutcome::Redirect(url) => {
            assert_eq!(query(&url, "error").as_deref(), Some("unsupported_response_type"));
            assert_eq!(query(&url, "state").as_deref(), Some("opaque-state"));
        }
        other => panic!("expected an error redirect, got {:?}", other),
    }
}

#[test]
fn undefined_scopes_redirect_invalid_scope() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email admin"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    match outcome {
        AuthorizeOutcome::Redirect(url) => {
            assert_eq!(query(&url, "error").as_deref(), Some("invalid_scope"));
            assert!(query(&url, "error_description").unwrap().contains("admin"));
        }
        other => panic!("expected an error redirect, got {:?}", other),
    }
}

#[test]
fn unknown_clients_do_not_get_a_redirect() {
    let deployment = Deployment::new();
    let result = deployment.server.issue_authorization_response(
        &authorize_request("nobody", "email"),
        &deployment.session,
        Some("alice"),
    );
    match result {
        Err(Error::Protocol(err)) => assert_eq!(err.kind(), ProtocolErrorKind::InvalidRequest),
        other => panic!("expected a direct error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn resuming_an_unprocessed_request_is_an_invalid_call() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(CONSENT_CLIENT, "email"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let request_id = match outcome {
        AuthorizeOutcome::Consent { request_id, .. } => request_id,
        other => panic!("expected a consent hop, got {:?}", other),
    };
    assert!(matches!(
        deployment.server.resume_authorization(&request_id, &deployment.session),
        Err(Error::InvalidCall(_))
    ));
}

#[test]
fn unsupported_grant_types_are_rejected() {
    let deployment = Deployment::new();
    let request = request_with(&[("grant_type", "password"), ("client_id", CONSENT_CLIENT)]);
    match deployment.server.issue_token_response(&request) {
        Err(Error::Protocol(err)) => {
            assert_eq!(err.kind(), ProtocolErrorKind::UnsupportedGrantType)
        }
        other => panic!("expected unsupported_grant_type, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn revoked_tokens_are_rejected() {
    let deployment = Deployment::new();
    let request = request_with(&[
        ("grant_type", "client_credentials"),
        ("client_id", MACHINE_CLIENT),
        ("client_secret", CLIENT_SECRET),
        ("scope", "email"),
    ]);
    let response = deployment.server.issue_token_response(&request).unwrap();
    let resource = deployment.resource();

    let auth = resource
        .validate_authenticated_request(&bearer(&response.access_token))
        .unwrap();
    assert_eq!(auth.user_id(), None);
    assert_eq!(auth.subject(), MACHINE_CLIENT);

    deployment.tokens.revoke(auth.token_id()).unwrap();
    match resource.validate_authenticated_request(&bearer(&response.access_token)) {
        Err(Error::Protocol(err)) => assert_eq!(err.kind(), ProtocolErrorKind::InvalidToken),
        other => panic!("expected invalid_token, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn expired_tokens_fail_even_without_revocation_validation() {
    let mut expired = config();
    expired.default_access_token_ttl = Duration::minutes(-5);
    let deployment = Deployment::with_config(expired);

    let request = request_with(&[
        ("grant_type", "client_credentials"),
        ("client_id", MACHINE_CLIENT),
        ("client_secret", CLIENT_SECRET),
    ]);
    let response = deployment.server.issue_token_response(&request).unwrap();

    let mut lenient = config();
    lenient.resource_server_access_token_revocation_validation = false;
    let resource = ResourceServer::new(&lenient, None).unwrap();
    match resource.validate_authenticated_request(&bearer(&response.access_token)) {
        Err(Error::Protocol(err)) => assert_eq!(err.kind(), ProtocolErrorKind::InvalidToken),
        other => panic!("expected invalid_token, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn garbage_bearer_tokens_are_invalid() {
    let deployment = Deployment::new();
    let resource = deployment.resource();
    assert!(matches!(
        resource.validate_authenticated_request(&BearerRequest(None)),
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        resource.validate_authenticated_request(&BearerRequest(Some("Basic dXNlcg==".to_string()))),
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        resource.validate_authenticated_request(&bearer("not.a.jwt")),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn roles_gate_the_facades() {
    let mut authorization_only = config();
    authorization_only.server_role = ServerRole::AUTHORIZATION_SERVER;
    assert!(matches!(
        ResourceServer::new(&authorization_only, Some(Box::new(MemoryTokenStore::new()))),
        Err(ConfigError::DisabledRole("resource_server"))
    ));

    let mut resource_only = config();
    resource_only.server_role = ServerRole::RESOURCE_SERVER;
    let tokens = Arc::new(MemoryTokenStore::new());
    assert!(matches!(
        AuthorizationServer::new(
            resource_only,
            Collaborators {
                registrar: Box::new(registrar()),
                tokens: Box::new(Arc::clone(&tokens)),
                approvals: Box::new(MemoryApprovals::new()),
                users: Box::new(users()),
            },
        ),
        Err(ConfigError::DisabledRole("authorization_server"))
    ));
}

#[test]
fn missing_settings_fail_fast_by_name() {
    let mut no_issuer = config();
    no_issuer.issuer_url = String::new();
    let tokens = Arc::new(MemoryTokenStore::new());
    match AuthorizationServer::new(
        no_issuer,
        Collaborators {
            registrar: Box::new(registrar()),
            tokens: Box::new(Arc::clone(&tokens)),
            approvals: Box::new(MemoryApprovals::new()),
            users: Box::new(users()),
        },
    ) {
        Err(ConfigError::MissingSetting(name)) => assert_eq!(name, "issuer_url"),
        other => panic!("expected MissingSetting, got {:?}", other.err()),
    }

    // Revocation validation is on by default and needs a token store.
    assert!(matches!(
        ResourceServer::new(&config(), None),
        Err(ConfigError::MissingSetting(_))
    ));
}

#[test]
fn confidential_error_messages_are_gated_by_config() {
    let internal = Error::from(ServerError("backing store rejected the credentials".to_string()));

    let deployment = Deployment::new();
    assert_eq!(deployment.server.public_error_message(&internal), "internal error");
    assert_eq!(deployment.resource().public_error_message(&internal), "internal error");

    let mut verbose = config();
    verbose.display_confidential_exception_messages = true;
    let deployment = Deployment::with_config(verbose);
    assert!(deployment
        .server
        .public_error_message(&internal)
        .contains("backing store rejected the credentials"));

    // Protocol errors are part of the wire contract and always public.
    let protocol = Error::from(ProtocolError::invalid_request("missing client_id"));
    let deployment = Deployment::new();
    assert!(deployment.server.public_error_message(&protocol).contains("missing client_id"));
}

#[test]
fn openid_connect_attaches_id_tokens_and_gates_refresh_tokens() {
    let mut oidc = config();
    oidc.enable_openid_connect = true;
    let deployment = Deployment::with_config(oidc);

    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(FIRST_PARTY_CLIENT, "email"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let redirect = match outcome {
        AuthorizeOutcome::Redirect(url) => url,
        other => panic!("expected an immediate redirect, got {:?}", other),
    };
    let code = query(&redirect, "code").unwrap();
    let response = deployment.exchange_code(&code, FIRST_PARTY_CLIENT);

    let id_token = response.id_token.expect("openid grant carries an id token");
    assert_eq!(id_token.split('.').count(), 3);
    // Without `offline_access` no refresh token accompanies the grant.
    assert!(response.refresh_token.is_none());

    // With it, the refresh token is back.
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(FIRST_PARTY_CLIENT, "email offline_access"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let redirect = match outcome {
        AuthorizeOutcome::Redirect(url) => url,
        other => panic!("expected an immediate redirect, got {:?}", other),
    };
    let code = query(&redirect, "code").unwrap();
    let response = deployment.exchange_code(&code, FIRST_PARTY_CLIENT);
    assert!(response.refresh_token.is_some());
}

#[test]
fn discovery_follows_the_configuration() {
    let deployment = Deployment::new();
    assert!(deployment.server.discovery_document().is_none());

    let mut discoverable = config();
    discoverable.enable_openid_connect = true;
    discoverable.enable_openid_connect_discovery = true;
    let deployment = Deployment::with_config(discoverable);
    let document = deployment.server.discovery_document().unwrap();
    assert_eq!(document["issuer"], serde_json::json!("https://auth.example"));
    assert_eq!(
        document["grant_types_supported"],
        serde_json::json!(["authorization_code", "client_credentials", "refresh_token"])
    );

    let mut quiet = config();
    quiet.enable_openid_connect = true;
    quiet.enable_openid_connect_discovery = true;
    quiet.openid_connect_discovery_include_supported_grant_types = false;
    let deployment = Deployment::with_config(quiet);
    let document = deployment.server.discovery_document().unwrap();
    assert!(document.get("grant_types_supported").is_none());

    // The JWKS document is always available.
    assert_eq!(deployment.server.jwks()["keys"][0]["kty"], serde_json::json!("RSA"));
}

#[test]
fn userinfo_releases_claims_per_scope() {
    let deployment = Deployment::new();
    let outcome = deployment
        .server
        .issue_authorization_response(
            &authorize_request(FIRST_PARTY_CLIENT, "email"),
            &deployment.session,
            Some("alice"),
        )
        .unwrap();
    let redirect = match outcome {
        AuthorizeOutcome::Redirect(url) => url,
        other => panic!("expected an immediate redirect, got {:?}", other),
    };
    let code = query(&redirect, "code").unwrap();
    let response = deployment.exchange_code(&code, FIRST_PARTY_CLIENT);

    let auth = deployment
        .resource()
        .validate_authenticated_request(&bearer(&response.access_token))
        .unwrap();
    let user = users()
        .find_by_identifier(auth.user_id().unwrap())
        .unwrap()
        .unwrap();
    let body = crate::oidc::userinfo(&user, &auth.scopes(), &crate::oidc::ScopeClaims::standard());
    assert_eq!(body["sub"], serde_json::json!("alice"));
    assert_eq!(body["email"], serde_json::json!("alice@example.com"));
    // `profile` was not granted.
    assert!(body.get("name").is_none());
}
