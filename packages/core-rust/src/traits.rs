//! Credential and session store contracts consulted during identity resolution.

use async_trait::async_trait;

use crate::types::Principal;

/// Failure outcomes of a credential or session lookup.
///
/// `NotFound` is the normal outcome for a bad or stale credential;
/// `Unavailable` means the lookup mechanism itself failed.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl CredentialError {
    /// Stable label used in log fields and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Maps an opaque token to the principal it was issued for.
/// Implementations: in-memory digest table, HS256 JWT, chained stores.
///
/// Must be safe to call concurrently from many connections; callers never
/// serialize access.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve a token to its principal.
    async fn resolve(&self, token: &str) -> Result<Principal, CredentialError>;
}

/// Maps a session key (from the session cookie) to the logged-in principal.
/// Expired sessions must be reported as `NotFound`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the principal bound to a session key.
    async fn load(&self, session_key: &str) -> Result<Principal, CredentialError>;
}
