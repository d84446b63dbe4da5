//! Message ownership
//!
//! A message belongs either to an anonymous device identity or to an
//! authenticated user, never both. Every query and subscription takes an
//! [`OwnerFilter`] built from these refs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Opaque token identifying an unauthenticated device profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnonymousId(Uuid);

impl AnonymousId {
    /// Mint a fresh token. Tokens are never reused after rotation.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AnonymousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AnonymousId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Invalid anonymous id '{}': {}", s, e)))
    }
}

/// Identifier assigned by the auth provider after sign-in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("User id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRef {
    Anonymous(AnonymousId),
    User(UserId),
}

impl OwnerRef {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, OwnerRef::Anonymous(_))
    }

    /// Storage discriminator used by the `owner_kind` column
    pub fn kind_str(&self) -> &'static str {
        match self {
            OwnerRef::Anonymous(_) => "anonymous",
            OwnerRef::User(_) => "user",
        }
    }

    /// Storage value used by the `owner_id` column
    pub fn id_string(&self) -> String {
        match self {
            OwnerRef::Anonymous(id) => id.to_string(),
            OwnerRef::User(id) => id.to_string(),
        }
    }

    /// Rebuild from the `(owner_kind, owner_id)` column pair
    pub fn from_parts(kind: &str, id: &str) -> Result<Self> {
        match kind {
            "anonymous" => Ok(OwnerRef::Anonymous(id.parse()?)),
            "user" => Ok(OwnerRef::User(UserId::new(id)?)),
            other => Err(Error::InvalidInput(format!("Unknown owner kind: {}", other))),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id_string())
    }
}

/// Set of owners whose messages are visible
///
/// Normally a single owner. While a merge is outstanding the filter holds
/// both the user and the not-yet-merged anonymous token so pre-login
/// history stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerFilter {
    owners: Vec<OwnerRef>,
}

impl OwnerFilter {
    pub fn single(owner: OwnerRef) -> Self {
        Self { owners: vec![owner] }
    }

    /// Build from several owners; duplicates are collapsed
    pub fn any_of(owners: impl IntoIterator<Item = OwnerRef>) -> Result<Self> {
        let mut collected: Vec<OwnerRef> = Vec::new();
        for owner in owners {
            if !collected.contains(&owner) {
                collected.push(owner);
            }
        }
        if collected.is_empty() {
            return Err(Error::InvalidInput("Owner filter must not be empty".to_string()));
        }
        Ok(Self { owners: collected })
    }

    pub fn matches(&self, owner: &OwnerRef) -> bool {
        self.owners.contains(owner)
    }

    pub fn owners(&self) -> &[OwnerRef] {
        &self.owners
    }
}
