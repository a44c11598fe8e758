//! Ordered composition of credential stores.

use std::sync::Arc;

use async_trait::async_trait;
use wsgate_core::{CredentialError, CredentialStore, Principal};

/// Consults each store in order and returns the first principal found.
///
/// `NotFound` moves on to the next store. An `Unavailable` store is skipped
/// too, but remembered: if no later store resolves the token, the chain
/// reports the first `Unavailable` error instead of `NotFound`.
pub struct ChainedCredentialStore {
    stores: Vec<Arc<dyn CredentialStore>>,
}

impl ChainedCredentialStore {
    #[must_use]
    pub fn new(stores: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self { stores }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait]
impl CredentialStore for ChainedCredentialStore {
    async fn resolve(&self, token: &str) -> Result<Principal, CredentialError> {
        let mut unavailable = None;
        for store in &self.stores {
            match store.resolve(token).await {
                Ok(principal) => return Ok(principal),
                Err(CredentialError::NotFound) => {}
                Err(e @ CredentialError::Unavailable(_)) => {
                    unavailable.get_or_insert(e);
                }
            }
        }
        Err(unavailable.unwrap_or(CredentialError::NotFound))
    }
}
