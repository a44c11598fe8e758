//! Per-connection context carried through the gateway pipeline.

use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use wsgate_core::{Identity, Principal, ResolvedIdentity};

use crate::network::ConnectionId;

/// Transport the connection arrived on. Only `WebSocket` connections are
/// processed by the gateway layers; everything else passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A real-time WebSocket channel.
    WebSocket,
    /// A plain HTTP request/response exchange.
    Http,
}

/// Returned when an identity is bound to a context that already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("identity already bound to connection")]
pub struct IdentityAlreadyBound;

/// Per-connection state created by the transport and threaded through the
/// gateway layers into the inner handler.
///
/// The identity slot is write-once: the authentication layer binds it
/// exactly once, and it is read-only from then on.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Registry-assigned connection identifier.
    pub id: ConnectionId,
    /// Transport this connection arrived on.
    pub kind: TransportKind,
    /// Request path of the upgrade request.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    /// Raw request headers of the upgrade request.
    pub headers: HeaderMap,
    session: Option<Identity>,
    identity: Option<ResolvedIdentity>,
    established_at_millis: Option<u64>,
    closed: CancellationToken,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(
        id: ConnectionId,
        kind: TransportKind,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            query: query.into(),
            headers,
            session: None,
            identity: None,
            established_at_millis: None,
            closed: CancellationToken::new(),
        }
    }

    /// Attaches an identity the transport already derived from an established session.
    #[must_use]
    pub fn with_session(mut self, session: Option<Identity>) -> Self {
        self.session = session;
        self
    }

    /// Replaces the close signal with one owned by the transport.
    #[must_use]
    pub fn with_close_signal(mut self, closed: CancellationToken) -> Self {
        self.closed = closed;
        self
    }

    /// The identity pre-bound by the transport, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Identity> {
        self.session.as_ref()
    }

    /// The resolved identity; `None` until the authentication layer runs.
    #[must_use]
    pub fn identity(&self) -> Option<&ResolvedIdentity> {
        self.identity.as_ref()
    }

    /// The authenticated principal, if the resolved identity has one.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.identity.as_ref().and_then(|r| r.identity.principal())
    }

    /// Binds the resolved identity. Never overwrites an existing binding.
    ///
    /// # Errors
    ///
    /// Returns `IdentityAlreadyBound` if an identity was bound earlier.
    pub fn bind_identity(&mut self, resolved: ResolvedIdentity) -> Result<(), IdentityAlreadyBound> {
        if self.identity.is_some() {
            return Err(IdentityAlreadyBound);
        }
        self.identity = Some(resolved);
        Ok(())
    }

    /// When the instrumentation layer first saw this connection (ms since epoch).
    #[must_use]
    pub fn established_at(&self) -> Option<u64> {
        self.established_at_millis
    }

    /// Records the establishment time. Only the first call has an effect.
    pub fn mark_established(&mut self, millis: u64) {
        self.established_at_millis.get_or_insert(millis);
    }

    /// Whether the peer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A handle to the close signal, for awaiting or triggering closure.
    #[must_use]
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}
