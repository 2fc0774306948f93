//! Defines the scope types and their parsing/formatting according to the rfc.
use std::{fmt, str};

use serde::{Deserialize, Serialize};

/// A single scope token as defined in [rfc6749 §3.3].
///
/// Scope-tokens are restricted to the following subset of ascii:
///   - The character '!'
///   - The character range '\x23' to '\x5b' which includes numbers and upper case letters
///   - The character range '\x5d' to '\x7e' which includes lower case letters
///
/// In particular, the characters '\x22' (`"`), '\x5c' (`\`) and the space are not allowed
/// inside a token; the space separates tokens on the wire.
///
/// [rfc6749 §3.3]: https://tools.ietf.org/html/rfc6749#section-3.3
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    token: String,
}

impl Scope {
    fn invalid_scope_char(ch: char) -> bool {
        match ch {
            '\x21' => false,
            ch if ('\x23'..='\x5b').contains(&ch) => false,
            ch if ('\x5d'..='\x7e').contains(&ch) => false,
            _ => true,
        }
    }

    /// View the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

/// Error returned from parsing a scope token or scope list.
#[derive(Debug, PartialEq)]
pub enum ParseScopeErr {
    /// A character was encountered which is not allowed to appear in scope strings.
    InvalidCharacter(char),

    /// The input contained no token at all where at least one was required.
    Empty,
}

impl str::FromStr for Scope {
    type Err = ParseScopeErr;

    fn from_str(string: &str) -> Result<Scope, ParseScopeErr> {
        if string.is_empty() {
            return Err(ParseScopeErr::Empty);
        }
        if let Some(ch) = string.chars().find(|&ch| Scope::invalid_scope_char(ch)) {
            return Err(ParseScopeErr::InvalidCharacter(ch));
        }
        Ok(Scope {
            token: string.to_string(),
        })
    }
}

impl fmt::Display for ParseScopeErr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            ParseScopeErr::InvalidCharacter(chr) => {
                write!(fmt, "Encountered invalid character in scope: {}", chr)
            }
            ParseScopeErr::Empty => write!(fmt, "Scope was empty"),
        }
    }
}

impl std::error::Error for ParseScopeErr {}

impl fmt::Debug for Scope {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("Scope").field(&self.token).finish()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.token)
    }
}

impl Serialize for Scope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.token)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

/// An ordered, duplicate-free collection of scope tokens.
///
/// Parsed from and formatted as the space-separated wire form. Request order is preserved,
/// since a consent screen presents scopes in the order the client asked for them. Membership
/// and the set operations go by identifier alone, but equality follows the order: two sets
/// holding the same identifiers in a different order compare unequal.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    tokens: Vec<Scope>,
}

impl ScopeSet {
    /// An empty scope set.
    pub fn new() -> ScopeSet {
        ScopeSet::default()
    }

    /// Append a scope unless it is already present.
    pub fn insert(&mut self, scope: Scope) {
        if !self.tokens.contains(&scope) {
            self.tokens.push(scope);
        }
    }

    /// Whether the identifier is contained in this set.
    pub fn contains(&self, identifier: &str) -> bool {
        self.tokens.iter().any(|scope| scope.as_str() == identifier)
    }

    /// Whether no scope is contained.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of scopes contained.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Iterate the scopes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.tokens.iter()
    }

    /// The scopes of `self` that are also in `other`, keeping the order of `self`.
    pub fn intersect(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet {
            tokens: self
                .tokens
                .iter()
                .filter(|scope| other.contains(scope.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// The scopes of `self` that are not in `other`, keeping the order of `self`.
    pub fn difference(&self, other: &ScopeSet) -> ScopeSet {
        ScopeSet {
            tokens: self
                .tokens
                .iter()
                .filter(|scope| !other.contains(scope.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// All scopes of `self` followed by the scopes of `other` not yet present.
    pub fn union(&self, other: &ScopeSet) -> ScopeSet {
        let mut merged = self.clone();
        for scope in other.iter() {
            merged.insert(scope.clone());
        }
        merged
    }

    /// Whether every scope of `self` is contained in `other`.
    pub fn is_subset_of(&self, other: &ScopeSet) -> bool {
        self.tokens.iter().all(|scope| other.contains(scope.as_str()))
    }
}

impl str::FromStr for ScopeSet {
    type Err = ParseScopeErr;

    fn from_str(string: &str) -> Result<ScopeSet, ParseScopeErr> {
        let mut set = ScopeSet::new();
        for token in string.split(' ').filter(|token| !token.is_empty()) {
            set.insert(token.parse()?);
        }
        Ok(set)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let output = self
            .tokens
            .iter()
            .map(Scope::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        fmt.write_str(&output)
    }
}

impl fmt::Debug for ScopeSet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("ScopeSet").field(&self.to_string()).finish()
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        let mut set = ScopeSet::new();
        for scope in iter {
            set.insert(scope);
        }
        set
    }
}

impl IntoIterator for ScopeSet {
    type Item = Scope;
    type IntoIter = std::vec::IntoIter<Scope>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.into_iter()
    }
}

impl Serialize for ScopeSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

/// A client's definition of one grantable scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopeEntry {
    /// The scope the client may request.
    pub scope: Scope,

    /// Granted without asking the user, whether requested or not.
    pub applied_automatically: bool,
}

impl ScopeEntry {
    /// A scope the user must consent to.
    pub fn required(scope: Scope) -> ScopeEntry {
        ScopeEntry {
            scope,
            applied_automatically: false,
        }
    }

    /// A scope applied without user consent.
    pub fn automatic(scope: Scope) -> ScopeEntry {
        ScopeEntry {
            scope,
            applied_automatically: true,
        }
    }
}
