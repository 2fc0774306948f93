//! A collection of primitives useful for more than one grant method.
//!
//! A primitive is the smallest independent unit of policy used in OAuth related processing. For
//! example, a `registrar` administers the known clients and their redirect urls, and an
//! `issuer` signs and records bearer tokens. Abstracting the underlying primitives into traits
//! makes it possible to provide –e.g.– an independent database based implementation, while the
//! provided in-memory variants cover tests and small deployments.
//!
//! These are what gets plugged into the [`AuthorizationServer`] and [`ResourceServer`] façades.
//!
//! ```
//! use consentry::primitives::prelude::*;
//!
//! let mut registrar = ClientMap::new();
//! registrar.register_client(
//!     Client::public("LocalClient", "https://client.example/endpoint".parse().unwrap())
//!         .with_scope_list(&"default".parse().unwrap()),
//! );
//! let tokens = MemoryTokenStore::new();
//! let approvals = MemoryApprovals::new();
//! let users = MemoryUsers::new();
//! ```
//!
//! [`AuthorizationServer`]: ../server/struct.AuthorizationServer.html
//! [`ResourceServer`]: ../server/struct.ResourceServer.html

pub mod approvals;
pub mod generator;
pub mod issuer;
pub mod registrar;
pub mod scope;
pub mod sealed;
pub mod users;

/// Commonly used primitives for embedding applications and back-ends.
pub mod prelude {
    pub use super::approvals::{ApprovalStore, MemoryApprovals};
    pub use super::generator::RandomGenerator;
    pub use super::issuer::{MemoryTokenStore, TokenIssuer, TokenStore};
    pub use super::registrar::{Client, ClientMap, ClientUrl, Registrar};
    pub use super::scope::{Scope, ScopeEntry, ScopeSet};
    pub use super::users::{MemoryUsers, UserRecord, UserStore};
}
