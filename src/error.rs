//! The error taxonomy of the engine.
//!
//! Errors fall into four families with distinct audiences:
//!
//! * [`ConfigError`] — the deployment is wrong; raised at construction or first use and fatal.
//! * [`ProtocolError`] — a request failed in a way [rfc6749]/[rfc6750] define an error response
//!   for; rendered either as a redirect back to the client or as a json body.
//! * [`InvalidCallError`] — the embedding application called the engine out of sequence.
//! * [`ServerError`] — a runtime condition only an administrator can fix, such as a configured
//!   default grant user that was never authorized.
//!
//! [rfc6749]: https://tools.ietf.org/html/rfc6749#section-5.2
//! [rfc6750]: https://tools.ietf.org/html/rfc6750#section-3.1

use std::borrow::Cow;
use std::vec;

use thiserror::Error;
use url::Url;

/// A fatal configuration defect, discovered while constructing a server façade.
///
/// Every variant names the offending setting or value so the log line pinpoints what to fix.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting required for the enabled server role was left empty.
    #[error("required setting `{0}` is not configured")]
    MissingSetting(&'static str),

    /// Key material referenced a file (via the `@` prefix) that could not be read.
    #[error("could not read key file `{path}`: {source}")]
    KeyFile {
        /// The path after the `@` prefix.
        path: String,
        /// The underlying io error.
        source: std::io::Error,
    },

    /// Key material was present but not usable.
    #[error("key `{name}` is malformed: {reason}")]
    MalformedKey {
        /// The setting the key came from.
        name: &'static str,
        /// Why the key was rejected.
        reason: String,
    },

    /// A storage encryption key was requested by a name that is not configured.
    #[error("storage encryption key `{0}` is not configured")]
    UnknownStorageKey(String),

    /// A grant type was configured by a name or numeric shorthand the engine does not know.
    #[error("unknown grant type `{0}` in server configuration")]
    UnknownGrantType(String),

    /// A configured url (issuer, endpoint path) did not parse.
    #[error("invalid url in setting `{name}`: {reason}")]
    InvalidUrl {
        /// The setting holding the url.
        name: &'static str,
        /// The parse failure.
        reason: String,
    },

    /// A façade was constructed for a role the deployment has disabled.
    #[error("the `{0}` role is not enabled in this deployment's server_role")]
    DisabledRole(&'static str),

    /// The OpenID Connect claims configuration could not be normalized.
    #[error("malformed claims configuration: {0}")]
    MalformedClaimsConfig(String),
}

/// Wire-level error codes defined by rfc6749 §4.1.2.1/§5.2 and rfc6750 §3.1.
///
/// Authorization-endpoint and token-endpoint codes share this enum since a single request
/// pipeline produces both; [`wire_code`](ProtocolErrorKind::wire_code) yields the exact
/// registered string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolErrorKind {
    /// The request is missing a required parameter, repeats a parameter or is otherwise
    /// malformed.
    InvalidRequest,

    /// Client authentication failed.
    InvalidClient,

    /// The provided authorization code or refresh token is invalid, expired, revoked or was
    /// issued to another client.
    InvalidGrant,

    /// The client is not authorized to use this grant or response type.
    UnauthorizedClient,

    /// The token endpoint does not support this grant type.
    UnsupportedGrantType,

    /// The authorization endpoint does not support this response type.
    UnsupportedResponseType,

    /// The requested scope is invalid, unknown, malformed or not grantable to this client.
    InvalidScope,

    /// The resource owner or the server denied the request.
    AccessDenied,

    /// A bearer token was missing, expired, revoked or malformed (rfc6750).
    InvalidToken,

    /// The bearer token does not carry the scope the resource requires (rfc6750).
    InsufficientScope,

    /// The server hit an unexpected condition. Exists as a code because a 500 status cannot be
    /// delivered through a redirect.
    ServerError,

    /// The server is temporarily unable to handle the request.
    TemporarilyUnavailable,
}

impl ProtocolErrorKind {
    /// The registered error string for the wire representation.
    pub fn wire_code(self) -> &'static str {
        match self {
            ProtocolErrorKind::InvalidRequest => "invalid_request",
            ProtocolErrorKind::InvalidClient => "invalid_client",
            ProtocolErrorKind::InvalidGrant => "invalid_grant",
            ProtocolErrorKind::UnauthorizedClient => "unauthorized_client",
            ProtocolErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            ProtocolErrorKind::UnsupportedResponseType => "unsupported_response_type",
            ProtocolErrorKind::InvalidScope => "invalid_scope",
            ProtocolErrorKind::AccessDenied => "access_denied",
            ProtocolErrorKind::InvalidToken => "invalid_token",
            ProtocolErrorKind::InsufficientScope => "insufficient_scope",
            ProtocolErrorKind::ServerError => "server_error",
            ProtocolErrorKind::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    /// The http status the rfc suggests for a direct (non-redirect) response.
    pub fn http_status(self) -> u16 {
        match self {
            ProtocolErrorKind::InvalidClient => 401,
            ProtocolErrorKind::InvalidToken => 401,
            ProtocolErrorKind::AccessDenied => 403,
            ProtocolErrorKind::InsufficientScope => 403,
            ProtocolErrorKind::ServerError => 500,
            ProtocolErrorKind::TemporarilyUnavailable => 503,
            _ => 400,
        }
    }
}

impl AsRef<str> for ProtocolErrorKind {
    fn as_ref(&self) -> &str {
        self.wire_code()
    }
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.wire_code())
    }
}

/// An error with a defined OAuth2 error response.
///
/// The same type covers every per-request failure mode; a revoked token and a malformed token
/// differ only in their description, never in type, so response handling stays uniform.
#[derive(Clone, Debug, Error)]
#[error("{kind}: {}", description.as_deref().unwrap_or("no further detail"))]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    description: Option<Cow<'static, str>>,
    uri: Option<Cow<'static, str>>,
}

impl ProtocolError {
    /// Construct an error of the given kind without further detail.
    pub fn new(kind: ProtocolErrorKind) -> Self {
        ProtocolError {
            kind,
            description: None,
            uri: None,
        }
    }

    /// An `invalid_request` error with a description.
    pub fn invalid_request<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::InvalidRequest).with_description(description)
    }

    /// An `invalid_client` error with a description.
    pub fn invalid_client<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::InvalidClient).with_description(description)
    }

    /// An `invalid_grant` error with a description.
    pub fn invalid_grant<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::InvalidGrant).with_description(description)
    }

    /// An `invalid_scope` error with a description.
    pub fn invalid_scope<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::InvalidScope).with_description(description)
    }

    /// An `invalid_token` error with a description.
    pub fn invalid_token<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::InvalidToken).with_description(description)
    }

    /// An `access_denied` error with a description.
    pub fn access_denied<D: Into<Cow<'static, str>>>(description: D) -> Self {
        ProtocolError::new(ProtocolErrorKind::AccessDenied).with_description(description)
    }

    /// Attach a short text explanation for the error.
    pub fn with_description<D: Into<Cow<'static, str>>>(mut self, description: D) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a uri identifying a resource explaining the error in detail.
    pub fn with_uri(mut self, uri: Url) -> Self {
        self.uri = Some(String::from(uri).into());
        self
    }

    /// The formal kind of the error.
    pub fn kind(&self) -> ProtocolErrorKind {
        self.kind
    }

    /// The attached description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Iterate the key-value pairs of the wire representation.
    ///
    /// The pairs go either into the query component of the redirect `Location` header or into
    /// the json body of the direct response, depending on the endpoint.
    pub fn iter(&self) -> <&Self as IntoIterator>::IntoIter {
        self.into_iter()
    }
}

impl From<ProtocolErrorKind> for ProtocolError {
    fn from(kind: ProtocolErrorKind) -> Self {
        ProtocolError::new(kind)
    }
}

impl IntoIterator for &'_ ProtocolError {
    type Item = (&'static str, Cow<'static, str>);
    type IntoIter = vec::IntoIter<(&'static str, Cow<'static, str>)>;

    fn into_iter(self) -> Self::IntoIter {
        let mut vec = vec![("error", Cow::Borrowed(self.kind.wire_code()))];
        if let Some(description) = &self.description {
            vec.push(("error_description", description.clone()));
        }
        if let Some(uri) = &self.uri {
            vec.push(("error_uri", uri.clone()));
        }
        vec.into_iter()
    }
}

/// The engine was driven out of sequence by the embedding application.
///
/// This is a defect in the caller, not in the request, and must not be rendered to the client.
#[derive(Debug, Error)]
#[error("invalid call: {0}")]
pub struct InvalidCallError(pub Cow<'static, str>);

impl InvalidCallError {
    /// Construct from a static or owned message.
    pub fn new<D: Into<Cow<'static, str>>>(message: D) -> Self {
        InvalidCallError(message.into())
    }
}

/// A runtime condition that only a deployment change can fix.
///
/// Raised for example when a client's configured default grant user exists but was never
/// authorized for that client. Maps to a 500 response; the message is confidential by default.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ServerError(pub String);

/// An error produced by one of the pluggable storage back-ends.
///
/// The engine never retries; the error propagates to the caller unchanged.
#[derive(Debug, Error)]
#[error("storage back-end failure: {0}")]
pub struct RepositoryError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

impl RepositoryError {
    /// Wrap an arbitrary back-end error.
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        RepositoryError(Box::new(err))
    }

    /// Wrap a plain message, for back-ends without a structured error type.
    pub fn message<D: Into<String>>(message: D) -> Self {
        RepositoryError(message.into().into())
    }
}

/// Union of the failure families a request-time operation can produce.
///
/// Construction-time operations return [`ConfigError`] directly; everything the façades do per
/// request funnels through this type so callers match once on the family.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// See [`InvalidCallError`].
    #[error(transparent)]
    InvalidCall(#[from] InvalidCallError),

    /// See [`ServerError`].
    #[error(transparent)]
    Server(#[from] ServerError),

    /// See [`RepositoryError`].
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ProtocolErrorKind> for Error {
    fn from(kind: ProtocolErrorKind) -> Self {
        Error::Protocol(kind.into())
    }
}

impl Error {
    /// The message that may be shown in a response body.
    ///
    /// Protocol errors are always public. For the other families the detailed message is only
    /// released when `display_confidential_messages` is set (a development aid); production
    /// deployments get a generic line instead.
    pub fn public_message(&self, display_confidential_messages: bool) -> String {
        match self {
            Error::Protocol(err) => err.to_string(),
            other if display_confidential_messages => other.to_string(),
            Error::InvalidCall(_) | Error::Config(_) => "internal error".to_string(),
            Error::Server(_) | Error::Repository(_) => "internal error".to_string(),
        }
    }

    /// The http status to respond with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Protocol(err) => err.kind().http_status(),
            _ => 500,
        }
    }
}
