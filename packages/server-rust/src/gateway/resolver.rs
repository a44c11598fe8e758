//! Identity resolver strategies, consulted in priority order.
//!
//! Each resolver inspects the connection context and either produces a
//! principal or declines. The authentication layer walks an ordered list of
//! resolvers and stops at the first one that produces a principal, so adding
//! or reordering credential sources is a change to that list only.
//!
//! Every lookup outcome is reported as a structured `tracing` event and a
//! `wsgate_auth_resolutions_total` counter increment. Token values are never
//! logged.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, COOKIE};
use http::HeaderMap;
use tracing::{debug, error, info};
use wsgate_core::{
    CredentialError, CredentialStore, Identity, IdentitySource, Principal, SessionStore,
};

use super::context::ConnectionContext;

/// One credential source in the resolution chain.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The terminal state this resolver produces on success.
    fn source(&self) -> IdentitySource;

    /// Attempt to resolve a principal. `None` means "no identity from this
    /// source" and resolution moves on; it is never fatal.
    async fn resolve(&self, ctx: &ConnectionContext) -> Option<Principal>;
}

// ---------------------------------------------------------------------------
// Credential extraction
// ---------------------------------------------------------------------------

/// Reads a token from a raw query string.
///
/// The query is decoded as `application/x-www-form-urlencoded`; blank values
/// are ignored and the first occurrence of a name wins. The `primary` name
/// takes precedence; `alias` is only used when `primary` is absent.
#[must_use]
pub fn query_token(query: &str, primary: &str, alias: &str) -> Option<String> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut from_alias = None;
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        if name == primary {
            return Some(value.into_owned());
        }
        if from_alias.is_none() && name == alias {
            from_alias = Some(value.into_owned());
        }
    }
    from_alias
}

/// Reads a token from the `Authorization` header.
///
/// The header value must start with `scheme` (case-sensitive) followed by a
/// single space; the remainder is returned verbatim. Anything else yields
/// `None`.
#[must_use]
pub fn header_token<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix(scheme)?.strip_prefix(' ')?;
    (!token.is_empty()).then_some(token)
}

/// Reads a cookie value from the `Cookie` headers.
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value)
}

// ---------------------------------------------------------------------------
// Outcome reporting
// ---------------------------------------------------------------------------

fn record_attempt(source: IdentitySource, outcome: &'static str) {
    metrics::counter!(
        "wsgate_auth_resolutions_total",
        "source" => source.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Logs a store lookup outcome and converts it to the resolver contract.
///
/// `NotFound` is logged at info level, `Unavailable` at error level.
fn report_lookup(
    ctx: &ConnectionContext,
    source: IdentitySource,
    result: Result<Principal, CredentialError>,
) -> Option<Principal> {
    match result {
        Ok(principal) => {
            record_attempt(source, "success");
            info!(
                conn_id = ctx.id.0,
                source = %source,
                principal = %principal.id,
                "connection authenticated"
            );
            Some(principal)
        }
        Err(err) => {
            record_attempt(source, err.as_str());
            match err {
                CredentialError::NotFound => info!(
                    conn_id = ctx.id.0,
                    source = %source,
                    "credential not found, trying next source"
                ),
                CredentialError::Unavailable(cause) => error!(
                    conn_id = ctx.id.0,
                    source = %source,
                    error = %cause,
                    "credential store unavailable, trying next source"
                ),
            }
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Accepts a non-anonymous identity pre-bound by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreboundSessionResolver;

#[async_trait]
impl IdentityResolver for PreboundSessionResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::Session
    }

    async fn resolve(&self, ctx: &ConnectionContext) -> Option<Principal> {
        let Some(Identity::Authenticated(principal)) = ctx.session() else {
            return None;
        };
        record_attempt(self.source(), "success");
        info!(
            conn_id = ctx.id.0,
            source = %self.source(),
            principal = %principal.id,
            "connection authenticated"
        );
        Some(principal.clone())
    }
}

/// Loads the session named by the session cookie from a session store.
pub struct SessionCookieResolver {
    sessions: Arc<dyn SessionStore>,
    cookie_name: String,
}

impl SessionCookieResolver {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>, cookie_name: impl Into<String>) -> Self {
        Self {
            sessions,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for SessionCookieResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::SessionCookie
    }

    async fn resolve(&self, ctx: &ConnectionContext) -> Option<Principal> {
        let session_key = cookie_value(&ctx.headers, &self.cookie_name)?;
        debug!(conn_id = ctx.id.0, "session cookie present");
        let result = self.sessions.load(session_key).await;
        report_lookup(ctx, self.source(), result)
    }
}

/// Resolves a token carried in the query string.
pub struct QueryTokenResolver {
    credentials: Arc<dyn CredentialStore>,
    primary: String,
    alias: String,
}

impl QueryTokenResolver {
    #[must_use]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        primary: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            primary: primary.into(),
            alias: alias.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for QueryTokenResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::QueryToken
    }

    async fn resolve(&self, ctx: &ConnectionContext) -> Option<Principal> {
        let token = query_token(&ctx.query, &self.primary, &self.alias)?;
        debug!(conn_id = ctx.id.0, "query token present");
        let result = self.credentials.resolve(&token).await;
        report_lookup(ctx, self.source(), result)
    }
}

/// Resolves a token carried in the `Authorization` header.
pub struct HeaderTokenResolver {
    credentials: Arc<dyn CredentialStore>,
    scheme: String,
}

impl HeaderTokenResolver {
    #[must_use]
    pub fn new(credentials: Arc<dyn CredentialStore>, scheme: impl Into<String>) -> Self {
        Self {
            credentials,
            scheme: scheme.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for HeaderTokenResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::HeaderToken
    }

    async fn resolve(&self, ctx: &ConnectionContext) -> Option<Principal> {
        let token = header_token(&ctx.headers, &self.scheme)?;
        debug!(conn_id = ctx.id.0, "authorization header token present");
        let result = self.credentials.resolve(token).await;
        report_lookup(ctx, self.source(), result)
    }
}
