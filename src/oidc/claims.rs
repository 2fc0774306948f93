//! Claim definitions and the heterogeneous claims configuration.
//!
//! Deployments describe which claims a scope releases in whatever shape is most convenient: a
//! bare claim name, a fully specified [`OidcClaim`], or a keyed entry mapping a claim name to
//! an attribute or to a claim value. [`normalize`] folds all of those into a uniform list, so
//! the rest of the engine only ever deals with [`OidcClaim`]s.
use serde_json::Value;

use crate::error::ConfigError;
use crate::primitives::scope::ScopeSet;
use crate::primitives::users::UserRecord;

/// Where the value of a claim comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimSource {
    /// Read the user attribute of this name.
    Attribute(String),

    /// The same fixed value for every user.
    Fixed(Value),
}

/// A single claim released to clients.
#[derive(Clone, Debug, PartialEq)]
pub struct OidcClaim {
    identifier: String,
    source: ClaimSource,
}

impl OidcClaim {
    /// A claim reading the user attribute of the same name.
    pub fn new(identifier: &str) -> OidcClaim {
        OidcClaim {
            identifier: identifier.to_string(),
            source: ClaimSource::Attribute(identifier.to_string()),
        }
    }

    /// A claim reading a differently named user attribute.
    pub fn from_attribute(identifier: &str, attribute: &str) -> OidcClaim {
        OidcClaim {
            identifier: identifier.to_string(),
            source: ClaimSource::Attribute(attribute.to_string()),
        }
    }

    /// A claim with a fixed value.
    pub fn fixed(identifier: &str, value: Value) -> OidcClaim {
        OidcClaim {
            identifier: identifier.to_string(),
            source: ClaimSource::Fixed(value),
        }
    }

    /// The claim name as it appears in tokens and the userinfo response.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The claim value for a user, `None` when the user has no such attribute.
    pub fn resolve(&self, user: &UserRecord) -> Option<Value> {
        match &self.source {
            ClaimSource::Attribute(attribute) => user.claims.get(attribute).cloned(),
            ClaimSource::Fixed(value) => Some(value.clone()),
        }
    }
}

/// One element of a claims configuration, before normalization.
pub enum ClaimsConfigItem {
    /// A bare claim name; reads the user attribute of the same name.
    Identifier(String),

    /// A fully specified claim; its own identifier is authoritative.
    Claim(OidcClaim),

    /// A keyed entry. The key names the claim unless the value carries its own identifier,
    /// in which case the key is ignored.
    Keyed {
        /// The claim name, used when the value does not bring one.
        key: String,

        /// The claim value behind the key.
        value: KeyedClaimValue,
    },
}

/// The value side of a keyed claims configuration entry.
pub enum KeyedClaimValue {
    /// The name of the user attribute to read.
    Attribute(String),

    /// A complete claim. Its identifier wins over the entry key.
    Claim(OidcClaim),
}

/// Fold a heterogeneous claims configuration into a uniform claim list.
///
/// A later definition of the same claim name replaces the earlier one. Empty names are a
/// configuration defect.
pub fn normalize(items: Vec<ClaimsConfigItem>) -> Result<Vec<OidcClaim>, ConfigError> {
    let mut claims: Vec<OidcClaim> = Vec::with_capacity(items.len());
    for item in items {
        let claim = match item {
            ClaimsConfigItem::Identifier(identifier) => OidcClaim::new(&identifier),
            ClaimsConfigItem::Claim(claim) => claim,
            ClaimsConfigItem::Keyed { key, value } => match value {
                KeyedClaimValue::Attribute(attribute) => OidcClaim::from_attribute(&key, &attribute),
                KeyedClaimValue::Claim(claim) => claim,
            },
        };
        if claim.identifier.is_empty() {
            return Err(ConfigError::MalformedClaimsConfig(
                "claim with an empty identifier".to_string(),
            ));
        }
        claims.retain(|existing| existing.identifier != claim.identifier);
        claims.push(claim);
    }
    Ok(claims)
}

/// Which claims each scope releases.
///
/// Pre-filled with the standard mapping of OpenID Connect core §5.4; [`define`](Self::define)
/// adds or replaces the claim list of a scope, taking any configuration shape [`normalize`]
/// accepts.
#[derive(Clone, Debug, Default)]
pub struct ScopeClaims {
    scopes: Vec<(String, Vec<OidcClaim>)>,
}

impl ScopeClaims {
    /// An empty mapping: no scope releases any claims.
    pub fn empty() -> ScopeClaims {
        ScopeClaims::default()
    }

    /// The standard mapping: `profile`, `email`, `address` and `phone`.
    pub fn standard() -> ScopeClaims {
        let names = |list: &[&str]| list.iter().map(|name| OidcClaim::new(name)).collect();
        ScopeClaims {
            scopes: vec![
                (
                    "profile".to_string(),
                    names(&[
                        "name",
                        "family_name",
                        "given_name",
                        "middle_name",
                        "nickname",
                        "preferred_username",
                        "profile",
                        "picture",
                        "website",
                        "gender",
                        "birthdate",
                        "zoneinfo",
                        "locale",
                        "updated_at",
                    ]),
                ),
                ("email".to_string(), names(&["email", "email_verified"])),
                ("address".to_string(), names(&["address"])),
                (
                    "phone".to_string(),
                    names(&["phone_number", "phone_number_verified"]),
                ),
            ],
        }
    }

    /// Set the claims a scope releases, replacing an existing definition.
    pub fn define(&mut self, scope: &str, items: Vec<ClaimsConfigItem>) -> Result<(), ConfigError> {
        let claims = normalize(items)?;
        self.scopes.retain(|(existing, _)| existing != scope);
        self.scopes.push((scope.to_string(), claims));
        Ok(())
    }

    /// Collect the claim values a user releases under the granted scopes.
    ///
    /// Claims the user has no value for are omitted, not sent as null.
    pub fn collect(&self, user: &UserRecord, granted: &ScopeSet) -> serde_json::Map<String, Value> {
        let mut collected = serde_json::Map::new();
        for (scope, claims) in &self.scopes {
            if !granted.contains(scope) {
                continue;
            }
            for claim in claims {
                if let Some(value) = claim.resolve(user) {
                    collected.insert(claim.identifier.clone(), value);
                }
            }
        }
        collected
    }
}
