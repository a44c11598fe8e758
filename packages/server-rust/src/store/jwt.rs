//! HS256 JWT credential store.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;
use wsgate_core::{CredentialError, CredentialStore, Principal};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// Treats a signed token as the credential: `sub` becomes the principal id,
/// the optional `roles` claim its roles. `exp` is required.
///
/// Any validation failure (bad signature, expiry, malformed token) is
/// `NotFound`; verification is local, so the store is never `Unavailable`.
pub struct JwtCredentialStore {
    key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialStore {
    #[must_use]
    pub fn new_hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl CredentialStore for JwtCredentialStore {
    async fn resolve(&self, token: &str) -> Result<Principal, CredentialError> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => {
                let Claims { sub, roles } = data.claims;
                let mut principal = Principal::new(sub);
                principal.roles = roles;
                Ok(principal)
            }
            Err(e) => {
                debug!(error = %e, "JWT rejected");
                Err(CredentialError::NotFound)
            }
        }
    }
}
