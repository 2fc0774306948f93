//! The server façades tying configuration, key material, grants and stores together.
//!
//! [`AuthorizationServer`] drives the authorization and token endpoints, [`ResourceServer`]
//! validates bearer tokens on protected endpoints. A deployment constructs one or both from a
//! single [`ServerConfig`], depending on its [`ServerRole`].
mod authorization;
mod config;
mod resource;

pub use authorization::{AuthorizationServer, AuthorizeOutcome, AuthorizeRequest, Collaborators};
pub use config::{EndpointPaths, ServerConfig, ServerRole};
pub use resource::{AuthenticatedRequest, ProtectedRequest, ResourceServer};

#[cfg(test)]
mod tests;
