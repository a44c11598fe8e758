//! Credential and session store implementations.

pub mod chain;
pub mod jwt;
pub mod memory;

pub use chain::ChainedCredentialStore;
pub use jwt::JwtCredentialStore;
pub use memory::{InMemoryCredentialStore, InMemorySessionStore, SessionRecord};
