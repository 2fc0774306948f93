//! Registrars administer a database of known clients.
//!
//! A registrar governs the redirect urls a client may use, the scopes it may request and how it
//! authenticates. When an oauth request turns up, it is the registrar's duty to verify the
//! client, its redirect url and its grantable scopes before any negotiation with the user
//! happens.
use super::scope::{Scope, ScopeEntry, ScopeSet};

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::iter::{Extend, FromIterator};
use std::sync::{Arc, MutexGuard, RwLockWriteGuard};

use argon2::{self, Config};
use once_cell::sync::Lazy;
use rand::{thread_rng, RngCore};
use url::Url;

/// Registrars provide a way to interact with clients.
///
/// Most importantly, they determine the validity of provided request parameters. In general,
/// implementations of this trait will probably offer an interface for registering new clients.
/// That interface is not covered by this library.
pub trait Registrar {
    /// Look up the public record of a client.
    ///
    /// The record never contains authentication material; checking credentials goes through
    /// [`check`](Registrar::check) so secrets stay inside the registrar.
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError>;

    /// Determine the redirection url for the client. Redirection urls are matched verbatim
    /// against the registered ones, not partially.
    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError>;

    /// Try to login as client with some authentication.
    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError>;
}

/// A pair of `client_id` and an optional `redirect_uri`.
///
/// Such a pair is received in an authorization code request. A registrar which allows multiple
/// urls per client can use the optional parameter to choose the correct url, for example for a
/// native client that opens a local port for the redirect.
#[derive(Clone, Debug)]
pub struct ClientUrl<'a> {
    /// The identifier indicated.
    pub client_id: Cow<'a, str>,

    /// The parsed url, if any.
    pub redirect_uri: Option<Cow<'a, Url>>,
}

/// A client and its chosen redirection endpoint.
#[derive(Clone, Debug)]
pub struct BoundClient<'a> {
    /// The identifier of the client, moved from the request.
    pub client_id: Cow<'a, str>,

    /// The chosen redirection endpoint url, moved from the request or defaulted.
    pub redirect_uri: Cow<'a, Url>,
}

/// Handled responses from a registrar.
#[derive(Clone, Debug)]
pub enum RegistrarError {
    /// One of several different causes that should be indistinguishable.
    ///
    /// * Indicates an entirely unknown client.
    /// * The client is not authorized.
    /// * The redirection url was not the registered one. An exact match on the url is performed
    ///   to prevent injection of bad query parameters.
    ///
    /// These should be indistinguishable to avoid security problems.
    Unspecified,

    /// Something went wrong with this primitive that has no security reason.
    PrimitiveError,
}

/// The public record of a registered client.
///
/// This is what grant handling works with: grantable scopes, consent requirements and the
/// optional default user for the client credentials grant. Authentication data stays behind
/// the registrar.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    /// The registered client id.
    pub client_id: String,

    /// The default redirection url.
    pub redirect_uri: Url,

    /// Redirect uris accepted in addition to `redirect_uri`.
    pub additional_redirect_uris: Vec<Url>,

    /// The scopes this client may be granted, with their consent behavior.
    pub scopes: Vec<ScopeEntry>,

    /// Whether issuing to this client needs explicit user authorization. First-party clients
    /// typically disable this and skip the consent screen entirely.
    pub requires_user_authorization: bool,

    /// The user on whose behalf a client credentials grant is issued, if configured.
    pub default_grant_user_id: Option<String>,

    /// Whether the client is public or confidential.
    pub confidential: bool,
}

impl ClientRecord {
    /// The scope entry for an identifier, if the client defines it.
    pub fn scope_entry(&self, identifier: &str) -> Option<&ScopeEntry> {
        self.scopes.iter().find(|entry| entry.scope.as_str() == identifier)
    }

    /// The scopes this client gets applied automatically.
    pub fn automatic_scopes(&self) -> ScopeSet {
        self.scopes
            .iter()
            .filter(|entry| entry.applied_automatically)
            .map(|entry| entry.scope.clone())
            .collect()
    }
}

/// A client under registration, before its credentials are encoded.
#[derive(Clone, Debug)]
pub struct Client {
    record: ClientRecord,
    auth: ClientAuth,
}

#[derive(Clone)]
enum ClientAuth {
    Public,
    Confidential { passphrase: Vec<u8> },
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            ClientAuth::Public => write!(f, "<public>"),
            ClientAuth::Confidential { .. } => write!(f, "<confidential>"),
        }
    }
}

/// A client whose credentials have been wrapped by a password policy.
///
/// This provides a standard encoding for registrars who wish to store their clients and makes
/// it possible to test password policies.
#[derive(Clone, Debug)]
pub struct EncodedClient {
    /// The public client record.
    pub record: ClientRecord,

    /// Byte data encoding the password authentication under the used policy, confidential
    /// clients only.
    pub passdata: Option<Vec<u8>>,
}

impl Client {
    /// Create a public client.
    pub fn public(client_id: &str, redirect_uri: Url) -> Client {
        Client {
            record: ClientRecord {
                client_id: client_id.to_string(),
                redirect_uri,
                additional_redirect_uris: vec![],
                scopes: vec![],
                requires_user_authorization: true,
                default_grant_user_id: None,
                confidential: false,
            },
            auth: ClientAuth::Public,
        }
    }

    /// Create a confidential client.
    pub fn confidential(client_id: &str, redirect_uri: Url, passphrase: &[u8]) -> Client {
        Client {
            record: ClientRecord {
                client_id: client_id.to_string(),
                redirect_uri,
                additional_redirect_uris: vec![],
                scopes: vec![],
                requires_user_authorization: true,
                default_grant_user_id: None,
                confidential: true,
            },
            auth: ClientAuth::Confidential {
                passphrase: passphrase.to_owned(),
            },
        }
    }

    /// Add additional redirect uris.
    pub fn with_additional_redirect_uris(mut self, uris: Vec<Url>) -> Self {
        self.record.additional_redirect_uris = uris;
        self
    }

    /// Define the scopes this client may be granted.
    pub fn with_scopes(mut self, scopes: Vec<ScopeEntry>) -> Self {
        self.record.scopes = scopes;
        self
    }

    /// Define grantable scopes from a space-separated list, none of them automatic.
    pub fn with_scope_list(mut self, scopes: &ScopeSet) -> Self {
        self.record.scopes = scopes.iter().cloned().map(ScopeEntry::required).collect();
        self
    }

    /// Skip the consent screen for this client (first-party clients).
    pub fn without_user_authorization(mut self) -> Self {
        self.record.requires_user_authorization = false;
        self
    }

    /// Set the default user for the client credentials grant.
    pub fn with_default_grant_user(mut self, user_id: &str) -> Self {
        self.record.default_grant_user_id = Some(user_id.to_string());
        self
    }

    /// Obscure the client's authentication data.
    ///
    /// This applies a one-way function to the passphrase using an adequate password hashing
    /// method. The resulting passdata is then used for validating authentication details
    /// provided when later reasserting the identity of the client.
    pub fn encode(self, policy: &dyn PasswordPolicy) -> EncodedClient {
        let passdata = match self.auth {
            ClientAuth::Public => None,
            ClientAuth::Confidential { passphrase } => {
                Some(policy.store(&self.record.client_id, &passphrase))
            }
        };

        EncodedClient {
            record: self.record,
            passdata,
        }
    }
}

/// Recombines an `EncodedClient` and a `PasswordPolicy` to check authentication.
pub struct RegisteredClient<'a> {
    client: &'a EncodedClient,
    policy: &'a dyn PasswordPolicy,
}

impl<'a> RegisteredClient<'a> {
    /// Binds a client and a policy reference together.
    ///
    /// The policy should be the same or equivalent to the policy used to create the encoded
    /// client data, as otherwise authentication will obviously not work.
    pub fn new(client: &'a EncodedClient, policy: &'a dyn PasswordPolicy) -> Self {
        RegisteredClient { client, policy }
    }

    /// Try to authenticate with the client and passphrase. This check will succeed if either
    /// the client is public and no passphrase was provided or if the client is confidential
    /// and the passphrase matches.
    pub fn check_authentication(&self, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        match (passphrase, &self.client.passdata) {
            (None, None) => Ok(()),
            (Some(provided), Some(stored)) => {
                self.policy.check(&self.client.record.client_id, provided, stored)
            }
            _ => Err(RegistrarError::Unspecified),
        }
    }
}

/// Determines how passphrases are stored and checked.
///
/// The provided library implementation is based on `Argon2`.
pub trait PasswordPolicy: Send + Sync {
    /// Transform the passphrase so it can be stored in the confidential client.
    fn store(&self, client_id: &str, passphrase: &[u8]) -> Vec<u8>;

    /// Check if the stored data corresponds to that of the client id and passphrase.
    fn check(&self, client_id: &str, passphrase: &[u8], stored: &[u8]) -> Result<(), RegistrarError>;
}

/// Store passwords using `Argon2` to derive the stored value.
#[derive(Clone, Debug, Default)]
pub struct Argon2 {}

impl PasswordPolicy for Argon2 {
    fn store(&self, client_id: &str, passphrase: &[u8]) -> Vec<u8> {
        let mut config = Config::default();
        config.ad = client_id.as_bytes();
        config.secret = &[];

        let mut salt = vec![0; 32];
        thread_rng()
            .try_fill_bytes(salt.as_mut_slice())
            .expect("Failed to generate password salt");

        let encoded = argon2::hash_encoded(passphrase, &salt, &config);
        encoded.unwrap().as_bytes().to_vec()
    }

    fn check(&self, client_id: &str, passphrase: &[u8], stored: &[u8]) -> Result<(), RegistrarError> {
        let hash = String::from_utf8(stored.to_vec());
        let valid = match hash {
            Ok(hash) => argon2::verify_encoded_ext(&hash, passphrase, &[], client_id.as_bytes())
                .map_err(|_| RegistrarError::Unspecified),
            _ => Err(RegistrarError::Unspecified),
        };

        match valid {
            Ok(true) => Ok(()),
            _ => Err(RegistrarError::Unspecified),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//                             Standard Implementations of Registrars                            //
///////////////////////////////////////////////////////////////////////////////////////////////////

static DEFAULT_PASSWORD_POLICY: Lazy<Argon2> = Lazy::new(Argon2::default);

/// A very simple, in-memory hash map of client ids to client entries.
#[derive(Default)]
pub struct ClientMap {
    clients: HashMap<String, EncodedClient>,
    password_policy: Option<Box<dyn PasswordPolicy>>,
}

impl ClientMap {
    /// Create an empty map without any clients in it.
    pub fn new() -> ClientMap {
        ClientMap::default()
    }

    /// Insert or update the client record.
    pub fn register_client(&mut self, client: Client) {
        let password_policy = Self::current_policy(&self.password_policy);
        self.clients
            .insert(client.record.client_id.clone(), client.encode(password_policy));
    }

    /// Change how passwords are encoded while stored.
    pub fn set_password_policy<P: PasswordPolicy + 'static>(&mut self, new_policy: P) {
        self.password_policy = Some(Box::new(new_policy))
    }

    // This is not an instance method because it needs to borrow the box but register needs &mut
    fn current_policy(policy: &Option<Box<dyn PasswordPolicy>>) -> &dyn PasswordPolicy {
        policy
            .as_ref()
            .map(|boxed| &**boxed)
            .unwrap_or(&*DEFAULT_PASSWORD_POLICY)
    }
}

impl Extend<Client> for ClientMap {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = Client>,
    {
        iter.into_iter().for_each(|client| self.register_client(client))
    }
}

impl FromIterator<Client> for ClientMap {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Client>,
    {
        let mut into = ClientMap::new();
        into.extend(iter);
        into
    }
}

impl<'s, R: Registrar + ?Sized> Registrar for &'s R {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        (**self).find_client(client_id)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        (**self).bound_redirect(bound)
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        (**self).check(client_id, passphrase)
    }
}

impl<R: Registrar + ?Sized> Registrar for Box<R> {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        (**self).find_client(client_id)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        (**self).bound_redirect(bound)
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        (**self).check(client_id, passphrase)
    }
}

impl<R: Registrar + ?Sized> Registrar for Arc<R> {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        (**self).find_client(client_id)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        (**self).bound_redirect(bound)
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        (**self).check(client_id, passphrase)
    }
}

impl<'s, R: Registrar + ?Sized + 's> Registrar for MutexGuard<'s, R> {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        (**self).find_client(client_id)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        (**self).bound_redirect(bound)
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        (**self).check(client_id, passphrase)
    }
}

impl<'s, R: Registrar + ?Sized + 's> Registrar for RwLockWriteGuard<'s, R> {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        (**self).find_client(client_id)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        (**self).bound_redirect(bound)
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        (**self).check(client_id, passphrase)
    }
}

impl Registrar for ClientMap {
    fn find_client(&self, client_id: &str) -> Result<ClientRecord, RegistrarError> {
        self.clients
            .get(client_id)
            .map(|client| client.record.clone())
            .ok_or(RegistrarError::Unspecified)
    }

    fn bound_redirect<'a>(&self, bound: ClientUrl<'a>) -> Result<BoundClient<'a>, RegistrarError> {
        let client = match self.clients.get(bound.client_id.as_ref()) {
            None => return Err(RegistrarError::Unspecified),
            Some(stored) => stored,
        };

        // Perform exact matching as motivated in the rfc
        match bound.redirect_uri {
            None => (),
            Some(ref url)
                if url.as_ref().as_str() == client.record.redirect_uri.as_str()
                    || client.record.additional_redirect_uris.contains(url) => {}
            _ => return Err(RegistrarError::Unspecified),
        }

        Ok(BoundClient {
            client_id: bound.client_id,
            redirect_uri: bound
                .redirect_uri
                .unwrap_or_else(|| Cow::Owned(client.record.redirect_uri.clone())),
        })
    }

    fn check(&self, client_id: &str, passphrase: Option<&[u8]>) -> Result<(), RegistrarError> {
        let password_policy = Self::current_policy(&self.password_policy);

        self.clients
            .get(client_id)
            .ok_or(RegistrarError::Unspecified)
            .and_then(|client| {
                RegisteredClient::new(client, password_policy).check_authentication(passphrase)
            })?;

        Ok(())
    }
}
