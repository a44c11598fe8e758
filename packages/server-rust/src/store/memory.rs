//! In-memory credential and session stores.
//!
//! Tokens are indexed by their hex SHA-256 digest so the table never holds
//! a usable credential. Both stores can be seeded from a JSON file at startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use wsgate_core::{ClockSource, CredentialError, CredentialStore, Principal, SessionStore};

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ---------------------------------------------------------------------------
// InMemoryCredentialStore
// ---------------------------------------------------------------------------

/// Token table keyed by digest.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: DashMap<String, Principal>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON object mapping token to principal:
    ///
    /// ```json
    /// { "abc123": { "id": "42", "roles": ["staff"] } }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not such an object.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        let entries: HashMap<String, Principal> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid credentials file {}", path.display()))?;

        let store = Self::new();
        for (token, principal) in entries {
            store.insert(&token, principal);
        }
        Ok(store)
    }

    /// Issues `token` for `principal`, replacing any previous binding.
    pub fn insert(&self, token: &str, principal: Principal) {
        self.tokens.insert(digest(token), principal);
    }

    /// Revokes `token`. Returns whether it was known.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(&digest(token)).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn resolve(&self, token: &str) -> Result<Principal, CredentialError> {
        self.tokens
            .get(&digest(token))
            .map(|entry| entry.value().clone())
            .ok_or(CredentialError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// InMemorySessionStore
// ---------------------------------------------------------------------------

/// A logged-in session: who, and until when (Unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionRecord {
    pub principal: Principal,
    pub expires_at: u64,
}

/// Session table keyed by session key. Expired entries read as `NotFound`
/// and are evicted on access.
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
    clock: Arc<dyn ClockSource>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
        }
    }

    /// Loads a JSON object mapping session key to [`SessionRecord`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>, clock: Arc<dyn ClockSource>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sessions file {}", path.display()))?;
        let entries: HashMap<String, SessionRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid sessions file {}", path.display()))?;

        let store = Self::new(clock);
        for (key, record) in entries {
            store.sessions.insert(key, record);
        }
        Ok(store)
    }

    pub fn insert(&self, session_key: &str, principal: Principal, expires_at: u64) {
        self.sessions.insert(
            session_key.to_string(),
            SessionRecord {
                principal,
                expires_at,
            },
        );
    }

    pub fn remove(&self, session_key: &str) -> bool {
        self.sessions.remove(session_key).is_some()
    }

    /// Drops `session_key` only if its record is still expired at `now`;
    /// a concurrently refreshed record is left in place.
    fn evict_if_expired(&self, session_key: &str, now: u64) -> bool {
        self.sessions
            .remove_if(session_key, |_, record| record.expires_at <= now)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_key: &str) -> Result<Principal, CredentialError> {
        let now = self.clock.now_millis() / 1000;
        let live = self
            .sessions
            .get(session_key)
            .map(|entry| (entry.expires_at > now).then(|| entry.principal.clone()));

        match live {
            Some(Some(principal)) => Ok(principal),
            Some(None) => {
                self.evict_if_expired(session_key, now);
                Err(CredentialError::NotFound)
            }
            None => Err(CredentialError::NotFound),
        }
    }
}
