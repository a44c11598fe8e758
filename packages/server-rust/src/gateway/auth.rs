//! Authentication layer: binds exactly one identity before the inner handler runs.
//!
//! Resolution walks the configured resolvers in order and stops at the first
//! one producing a principal. When none does, the anonymous identity is bound;
//! whether anonymous connections are acceptable is the inner handler's call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use tracing::{debug, warn};
use wsgate_core::{CredentialStore, IdentitySource, ResolvedIdentity, SessionStore};

use super::config::GatewayConfig;
use super::context::{ConnectionContext, TransportKind};
use super::resolver::{
    HeaderTokenResolver, IdentityResolver, PreboundSessionResolver, QueryTokenResolver,
    SessionCookieResolver,
};
use super::{Connection, GatewayError};

/// Walks `resolvers` in order and returns the first identity produced,
/// falling back to the anonymous identity.
pub async fn resolve_identity(
    resolvers: &[Arc<dyn IdentityResolver>],
    ctx: &ConnectionContext,
) -> ResolvedIdentity {
    for resolver in resolvers {
        if let Some(principal) = resolver.resolve(ctx).await {
            return ResolvedIdentity::authenticated(principal, resolver.source());
        }
    }

    metrics::counter!(
        "wsgate_auth_resolutions_total",
        "source" => IdentitySource::Anonymous.as_str(),
        "outcome" => "fallback"
    )
    .increment(1);
    warn!(
        conn_id = ctx.id.0,
        path = %ctx.path,
        "connection without valid authentication, binding anonymous identity"
    );
    ResolvedIdentity::anonymous()
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Tower layer that resolves and binds the connection identity.
#[derive(Clone)]
pub struct AuthLayer {
    resolvers: Arc<[Arc<dyn IdentityResolver>]>,
}

impl AuthLayer {
    /// Creates a layer consulting `resolvers` in the given order.
    #[must_use]
    pub fn new(resolvers: Vec<Arc<dyn IdentityResolver>>) -> Self {
        Self {
            resolvers: resolvers.into(),
        }
    }

    /// Creates a layer with the standard source precedence:
    ///
    /// 1. identity pre-bound by the transport
    /// 2. session cookie (only when a session store is supplied)
    /// 3. query-string token (primary name, then alias)
    /// 4. `Authorization` header token
    #[must_use]
    pub fn from_config(
        config: &GatewayConfig,
        credentials: Arc<dyn CredentialStore>,
        sessions: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        let mut resolvers: Vec<Arc<dyn IdentityResolver>> = vec![Arc::new(PreboundSessionResolver)];
        if let Some(sessions) = sessions {
            resolvers.push(Arc::new(SessionCookieResolver::new(
                sessions,
                config.session_cookie_name.clone(),
            )));
        }
        resolvers.push(Arc::new(QueryTokenResolver::new(
            Arc::clone(&credentials),
            config.query_token_param.clone(),
            config.query_token_alias.clone(),
        )));
        resolvers.push(Arc::new(HeaderTokenResolver::new(
            credentials,
            config.header_scheme.clone(),
        )));
        Self::new(resolvers)
    }

    /// Sources consulted by this layer, in order.
    #[must_use]
    pub fn sources(&self) -> Vec<IdentitySource> {
        self.resolvers.iter().map(|r| r.source()).collect()
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            resolvers: Arc::clone(&self.resolvers),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Service wrapper that binds the resolved identity before calling the inner handler.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    resolvers: Arc<[Arc<dyn IdentityResolver>]>,
}

impl<S> Service<Connection> for AuthService<S>
where
    S: Service<Connection, Error = GatewayError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, GatewayError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut conn: Connection) -> Self::Future {
        if conn.ctx.kind != TransportKind::WebSocket {
            return Box::pin(self.inner.call(conn));
        }

        // Take the service that was driven to readiness; leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let resolvers = Arc::clone(&self.resolvers);

        Box::pin(async move {
            let resolved = resolve_identity(&resolvers, &conn.ctx).await;

            // The peer left while the lookup was pending: drop the result.
            if conn.ctx.is_closed() {
                debug!(
                    conn_id = conn.ctx.id.0,
                    source = %resolved.source,
                    "connection closed during authentication, discarding identity"
                );
                return Err(GatewayError::ClosedDuringAuth);
            }

            if conn.ctx.bind_identity(resolved).is_err() {
                warn!(conn_id = conn.ctx.id.0, "identity already bound, keeping existing binding");
            }
            inner.call(conn).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use http::header::{AUTHORIZATION, COOKIE};
    use http::{HeaderMap, HeaderValue};
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use wsgate_core::{CredentialError, Identity, Principal};

    use super::*;
    use crate::gateway::sink::{ChannelSink, Outbound};
    use crate::network::{ConnectionConfig, ConnectionId, ConnectionRegistry};
    use crate::store::{InMemoryCredentialStore, InMemorySessionStore};

    /// Inner handler that records the identity it observed.
    #[derive(Clone, Default)]
    struct CaptureHandler {
        seen: Arc<Mutex<Vec<Option<ResolvedIdentity>>>>,
    }

    impl Service<Connection> for CaptureHandler {
        type Response = ();
        type Error = GatewayError;
        type Future = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, conn: Connection) -> Self::Future {
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                seen.lock().await.push(conn.ctx.identity().cloned());
                Ok(())
            })
        }
    }

    /// Store that is never reachable.
    struct DownStore;

    #[async_trait]
    impl CredentialStore for DownStore {
        async fn resolve(&self, _token: &str) -> Result<Principal, CredentialError> {
            Err(CredentialError::Unavailable(anyhow::anyhow!("database offline")))
        }
    }

    /// Store that blocks until released, then resolves every token.
    struct GatedStore {
        release: CancellationToken,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for GatedStore {
        async fn resolve(&self, _token: &str) -> Result<Principal, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.cancelled().await;
            Ok(Principal::new("late"))
        }
    }

    fn credentials() -> Arc<InMemoryCredentialStore> {
        let store = InMemoryCredentialStore::new();
        store.insert("abc123", Principal::new("42"));
        store.insert("header-only", Principal::new("99"));
        Arc::new(store)
    }

    fn connection(
        kind: TransportKind,
        query: &str,
        headers: HeaderMap,
        session: Option<Identity>,
    ) -> Connection {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig::default();
        let (handle, _rx) = registry.register("/ws", &config);
        let (_tx, inbound) = mpsc::channel(1);
        let outbound: Outbound = Arc::new(ChannelSink::new(Arc::clone(&handle), config.send_timeout));
        Connection {
            ctx: ConnectionContext::new(handle.id, kind, "/ws", query, headers).with_session(session),
            outbound,
            inbound,
        }
    }

    fn header(name: http::header::HeaderName, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    async fn resolve_with(
        layer: &AuthLayer,
        conn: Connection,
    ) -> Option<ResolvedIdentity> {
        let handler = CaptureHandler::default();
        let svc = layer.layer(handler.clone());
        svc.oneshot(conn).await.unwrap();
        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 1, "inner handler must run exactly once");
        seen[0].clone()
    }

    fn default_layer() -> AuthLayer {
        AuthLayer::from_config(&GatewayConfig::default(), credentials(), None)
    }

    #[tokio::test]
    async fn session_takes_precedence_over_tokens() {
        let mut headers = header(AUTHORIZATION, "Token header-only");
        headers.insert(COOKIE, HeaderValue::from_static("sessionid=whatever"));
        let conn = connection(
            TransportKind::WebSocket,
            "token=abc123",
            headers,
            Some(Identity::Authenticated(Principal::new("session-user"))),
        );

        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved.source, IdentitySource::Session);
        assert_eq!(resolved.identity.principal().unwrap().id, "session-user");
    }

    #[tokio::test]
    async fn query_token_resolves_identity() {
        let conn = connection(TransportKind::WebSocket, "token=abc123", HeaderMap::new(), None);
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(
            resolved,
            ResolvedIdentity::authenticated(Principal::new("42"), IdentitySource::QueryToken)
        );
    }

    #[tokio::test]
    async fn query_alias_resolves_identically() {
        let conn = connection(TransportKind::WebSocket, "auth_token=abc123", HeaderMap::new(), None);
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(
            resolved,
            ResolvedIdentity::authenticated(Principal::new("42"), IdentitySource::QueryToken)
        );
    }

    #[tokio::test]
    async fn query_token_beats_header_token() {
        let conn = connection(
            TransportKind::WebSocket,
            "token=abc123",
            header(AUTHORIZATION, "Token header-only"),
            None,
        );
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved.identity.principal().unwrap().id, "42");
    }

    #[tokio::test]
    async fn header_token_resolves_identity() {
        let conn = connection(
            TransportKind::WebSocket,
            "",
            header(AUTHORIZATION, "Token abc123"),
            None,
        );
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(
            resolved,
            ResolvedIdentity::authenticated(Principal::new("42"), IdentitySource::HeaderToken)
        );
    }

    #[tokio::test]
    async fn invalid_query_token_falls_through_to_header() {
        let conn = connection(
            TransportKind::WebSocket,
            "token=wrong",
            header(AUTHORIZATION, "Token abc123"),
            None,
        );
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved.source, IdentitySource::HeaderToken);
    }

    #[tokio::test]
    async fn wrong_header_scheme_yields_anonymous() {
        let conn = connection(
            TransportKind::WebSocket,
            "",
            header(AUTHORIZATION, "Bearer abc123"),
            None,
        );
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved, ResolvedIdentity::anonymous());
    }

    #[tokio::test]
    async fn unknown_token_binds_anonymous_and_still_runs_handler() {
        let conn = connection(TransportKind::WebSocket, "token=wrong", HeaderMap::new(), None);
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved, ResolvedIdentity::anonymous());
    }

    #[tokio::test]
    async fn no_credentials_binds_anonymous() {
        let conn = connection(TransportKind::WebSocket, "", HeaderMap::new(), None);
        let resolved = resolve_with(&default_layer(), conn).await.unwrap();
        assert_eq!(resolved, ResolvedIdentity::anonymous());
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_anonymous() {
        let layer = AuthLayer::from_config(&GatewayConfig::default(), Arc::new(DownStore), None);
        let conn = connection(
            TransportKind::WebSocket,
            "token=abc123",
            header(AUTHORIZATION, "Token abc123"),
            None,
        );
        let resolved = resolve_with(&layer, conn).await.unwrap();
        assert_eq!(resolved, ResolvedIdentity::anonymous());
    }

    #[tokio::test]
    async fn session_cookie_resolves_before_tokens() {
        let sessions = InMemorySessionStore::new(Arc::new(wsgate_core::SystemClock));
        sessions.insert("cookie-key", Principal::new("cookie-user"), u64::MAX / 1000);
        let layer = AuthLayer::from_config(
            &GatewayConfig::default(),
            credentials(),
            Some(Arc::new(sessions)),
        );
        assert_eq!(
            layer.sources(),
            vec![
                IdentitySource::Session,
                IdentitySource::SessionCookie,
                IdentitySource::QueryToken,
                IdentitySource::HeaderToken,
            ]
        );

        let conn = connection(
            TransportKind::WebSocket,
            "token=abc123",
            header(COOKIE, "sessionid=cookie-key"),
            None,
        );
        let resolved = resolve_with(&layer, conn).await.unwrap();
        assert_eq!(resolved.source, IdentitySource::SessionCookie);
        assert_eq!(resolved.identity.principal().unwrap().id, "cookie-user");
    }

    #[tokio::test]
    async fn non_websocket_connections_pass_through_untouched() {
        let conn = connection(TransportKind::Http, "token=abc123", HeaderMap::new(), None);
        let resolved = resolve_with(&default_layer(), conn).await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn closed_during_lookup_discards_result() {
        let store = Arc::new(GatedStore {
            release: CancellationToken::new(),
            calls: AtomicUsize::new(0),
        });
        let layer = AuthLayer::from_config(&GatewayConfig::default(), store.clone(), None);
        let handler = CaptureHandler::default();
        let svc = layer.layer(handler.clone());

        let conn = connection(TransportKind::WebSocket, "token=slow", HeaderMap::new(), None);
        let closed = conn.ctx.close_signal();
        let pending = tokio::spawn(svc.oneshot(conn));

        while store.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        closed.cancel();
        store.release.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(GatewayError::ClosedDuringAuth)));
        assert!(handler.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn custom_resolver_order_is_respected() {
        let creds = credentials();
        let resolvers: Vec<Arc<dyn IdentityResolver>> = vec![
            Arc::new(HeaderTokenResolver::new(creds.clone(), "Token")),
            Arc::new(QueryTokenResolver::new(creds, "token", "auth_token")),
        ];
        let layer = AuthLayer::new(resolvers);
        let conn = connection(
            TransportKind::WebSocket,
            "token=abc123",
            header(AUTHORIZATION, "Token header-only"),
            None,
        );
        let resolved = resolve_with(&layer, conn).await.unwrap();
        assert_eq!(resolved.identity.principal().unwrap().id, "99");
        assert_eq!(resolved.source, IdentitySource::HeaderToken);
    }

    #[test]
    fn connection_ids_are_preserved_in_context() {
        let conn = connection(TransportKind::WebSocket, "", HeaderMap::new(), None);
        assert_eq!(conn.ctx.id, ConnectionId(1));
    }
}
