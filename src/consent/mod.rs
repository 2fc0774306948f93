//! The user consent workflow.
//!
//! An authorization request that needs user input becomes a [`ClientAuthorizationRequest`]:
//! the requested scopes are partitioned by [`resolve`] into what needs asking, what was
//! decided before and what applies automatically, the interaction is parked in the session
//! via [`ConsentSessions`] while the user is on the consent screen, and
//! [`process_authorization`] seals the verdict exactly once.
//!
//! [`ClientAuthorizationRequest`]: request/struct.ClientAuthorizationRequest.html
//! [`resolve`]: resolve/fn.resolve.html
//! [`ConsentSessions`]: store/struct.ConsentSessions.html
//! [`process_authorization`]: request/struct.ClientAuthorizationRequest.html#method.process_authorization

pub mod request;
pub mod resolve;
pub mod store;

pub use request::{ClientAuthorizationRequest, ConsentDecision, ConsentStage, ConsentVerdict};
pub use resolve::{resolve, ScopeResolution};
pub use store::{ConsentSessions, MemorySession, SessionStore};
