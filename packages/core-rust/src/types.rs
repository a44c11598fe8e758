use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Authenticated principal returned by a credential or session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Opaque identifier for the authenticated entity.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Free-form attributes supplied by the identity store.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Principal {
    /// Creates a principal with no roles or attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a role, returning the principal for chaining.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Returns `true` if the principal holds the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// The identity bound to a connection: a concrete principal or the anonymous sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// A principal resolved from a session or credential.
    Authenticated(Principal),
    /// No credential source produced a principal.
    Anonymous,
}

impl Identity {
    /// Returns `true` for [`Identity::Authenticated`].
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// Returns the principal, if authenticated.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Authenticated(p) => Some(p),
            Self::Anonymous => None,
        }
    }
}

impl From<Principal> for Identity {
    fn from(principal: Principal) -> Self {
        Self::Authenticated(principal)
    }
}

/// Which credential source produced a connection's identity.
///
/// Each variant is a terminal state of the per-connection resolution
/// state machine: `Unresolved -> {Session | SessionCookie | QueryToken |
/// HeaderToken | Anonymous}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Identity pre-bound by the transport from an established session.
    Session,
    /// Identity loaded from the session cookie via the session store.
    SessionCookie,
    /// Token taken from the query string.
    QueryToken,
    /// Token taken from the `Authorization` header.
    HeaderToken,
    /// No source produced an identity.
    Anonymous,
}

impl IdentitySource {
    /// Stable label used in log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::SessionCookie => "session_cookie",
            Self::QueryToken => "query_token",
            Self::HeaderToken => "header_token",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity together with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub source: IdentitySource,
}

impl ResolvedIdentity {
    /// The anonymous fallback outcome.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identity: Identity::Anonymous,
            source: IdentitySource::Anonymous,
        }
    }

    /// An authenticated outcome from the given source.
    #[must_use]
    pub fn authenticated(principal: Principal, source: IdentitySource) -> Self {
        Self {
            identity: Identity::Authenticated(principal),
            source,
        }
    }
}
