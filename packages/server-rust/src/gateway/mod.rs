//! Connection gateway: identity resolution and outbound instrumentation
//! wrapped around a channel handler as tower layers.
//!
//! The composed pipeline is `Instrument(Auth(inner))`: instrumentation
//! observes every connection first, authentication binds exactly one
//! identity, and the inner handler runs with both in place.

pub mod auth;
pub mod config;
pub mod context;
pub mod instrument;
pub mod resolver;
pub mod sink;

use std::sync::Arc;

use tokio::sync::mpsc;
use tower::{Layer, ServiceBuilder};
use wsgate_core::{ClockSource, CredentialStore, Envelope, SessionStore};

use crate::network::SendError;

pub use auth::{AuthLayer, AuthService};
pub use config::GatewayConfig;
pub use context::{ConnectionContext, IdentityAlreadyBound, TransportKind};
pub use instrument::{InstrumentLayer, InstrumentService, TimestampInterceptor};
pub use resolver::IdentityResolver;
pub use sink::{ChannelSink, InterceptingSink, MessageSink, Outbound, OutboundInterceptor};

/// A connection as seen by the gateway pipeline.
pub struct Connection {
    /// Per-connection context; the identity is bound by [`AuthLayer`].
    pub ctx: ConnectionContext,
    /// Outbound path; decorated by [`InstrumentLayer`].
    pub outbound: Outbound,
    /// Inbound messages from the peer, in arrival order.
    pub inbound: mpsc::Receiver<Envelope>,
}

/// Errors surfaced by the gateway pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The peer disconnected before identity resolution finished.
    #[error("connection closed during authentication")]
    ClosedDuringAuth,

    /// An outbound message could not be delivered.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// The inner handler failed.
    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),
}

/// Both gateway layers, ready to wrap an inner handler.
#[derive(Clone)]
pub struct Gateway {
    instrument: InstrumentLayer,
    auth: AuthLayer,
}

impl Gateway {
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        credentials: Arc<dyn CredentialStore>,
        sessions: Option<Arc<dyn SessionStore>>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            instrument: InstrumentLayer::new(clock, &config.timestamp_key),
            auth: AuthLayer::from_config(config, credentials, sessions),
        }
    }

    /// Wraps `inner` so that instrumentation runs outside authentication.
    pub fn pipeline<S>(&self, inner: S) -> InstrumentService<AuthService<S>> {
        ServiceBuilder::new()
            .layer(self.instrument.clone())
            .layer(self.auth.clone())
            .service(inner)
    }
}

impl<S> Layer<S> for Gateway {
    type Service = InstrumentService<AuthService<S>>;

    fn layer(&self, inner: S) -> Self::Service {
        self.pipeline(inner)
    }
}
