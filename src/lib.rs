//! # consentry
//!
//! An OAuth2 and OpenID Connect authorization- and resource-server engine, for embedding into a
//! web application, featuring a set of configurable and pluggable back-ends and a first-class
//! user consent workflow.
//!
//! ## About
//!
//! `consentry` provides the protocol core of an OAuth2 provider: grant handling, scope
//! negotiation, consent tracking, token issuance and token validation. It deliberately owns no
//! transport and no storage. The embedding application supplies both through traits: requests
//! arrive as trait objects ([`AuthorizeRequest`], [`TokenRequest`], [`ProtectedRequest`]) and
//! persistence is delegated to a [`Registrar`], a [`TokenStore`], an [`ApprovalStore`], a
//! [`UserStore`] and a [`SessionStore`]. In-memory implementations of each are provided for
//! testing and small deployments.
//!
//! The two entry points are the façades in [`server`]:
//!
//! * [`AuthorizationServer`] drives the authorization endpoint (including the consent
//!   workflow built on [`ClientAuthorizationRequest`]) and the token endpoint with its
//!   pluggable [`GrantType`] implementations.
//! * [`ResourceServer`] validates bearer tokens on protected requests and exposes the token
//!   claims afterwards.
//!
//! A deployment acting only as a resource server needs nothing but the token verification key;
//! both roles can be combined in one process via [`ServerRole`].
//!
//! [`AuthorizeRequest`]: server/trait.AuthorizeRequest.html
//! [`TokenRequest`]: grants/trait.TokenRequest.html
//! [`ProtectedRequest`]: server/trait.ProtectedRequest.html
//! [`Registrar`]: primitives/registrar/trait.Registrar.html
//! [`TokenStore`]: primitives/issuer/trait.TokenStore.html
//! [`ApprovalStore`]: primitives/approvals/trait.ApprovalStore.html
//! [`UserStore`]: primitives/users/trait.UserStore.html
//! [`SessionStore`]: consent/store/trait.SessionStore.html
//! [`ClientAuthorizationRequest`]: consent/request/struct.ClientAuthorizationRequest.html
//! [`GrantType`]: grants/trait.GrantType.html
//! [`AuthorizationServer`]: server/struct.AuthorizationServer.html
//! [`ResourceServer`]: server/struct.ResourceServer.html
//! [`ServerRole`]: server/struct.ServerRole.html
//! [`server`]: server/index.html
#![warn(missing_docs)]

pub mod consent;
pub mod error;
pub mod grants;
pub mod keys;
pub mod oidc;
pub mod primitives;
pub mod server;
