//! Outbound send primitives and the interceptor chain wrapped around them.
//!
//! The transport hands the inner handler an [`Outbound`] sink. Gateway
//! layers decorate that sink with [`OutboundInterceptor`]s, each a plain
//! `Envelope -> Envelope` transformation, without the handler noticing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wsgate_core::Envelope;

use crate::network::{ConnectionHandle, SendError};

/// Primitive used by the inner handler to emit one message.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one envelope to the peer.
    ///
    /// Envelopes reach the transport in the order `send` calls complete;
    /// implementations must not reorder or batch.
    async fn send(&self, envelope: Envelope) -> Result<(), SendError>;
}

/// Shared handle to the outbound path of a connection.
pub type Outbound = Arc<dyn MessageSink>;

/// Sink that enqueues onto a connection's bounded outbound channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    handle: Arc<ConnectionHandle>,
    send_timeout: Duration,
}

impl ChannelSink {
    #[must_use]
    pub fn new(handle: Arc<ConnectionHandle>, send_timeout: Duration) -> Self {
        Self {
            handle,
            send_timeout,
        }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.handle.send_timeout(envelope, self.send_timeout).await
    }
}

/// A synchronous transformation applied to every outbound envelope.
pub trait OutboundInterceptor: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Transform one envelope. Must never fail; pass the input through
    /// unchanged when it cannot be handled.
    fn intercept(&self, envelope: Envelope) -> Envelope;
}

/// Sink decorator applying interceptors in list order before delegating.
///
/// The first interceptor sees the envelope exactly as the handler emitted
/// it; the inner sink receives the output of the last one.
pub struct InterceptingSink {
    inner: Outbound,
    interceptors: Vec<Arc<dyn OutboundInterceptor>>,
}

impl InterceptingSink {
    #[must_use]
    pub fn new(inner: Outbound, interceptors: Vec<Arc<dyn OutboundInterceptor>>) -> Self {
        Self {
            inner,
            interceptors,
        }
    }
}

impl fmt::Debug for InterceptingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("InterceptingSink")
            .field("interceptors", &names)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageSink for InterceptingSink {
    async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        let envelope = self
            .interceptors
            .iter()
            .fold(envelope, |env, interceptor| interceptor.intercept(env));
        self.inner.send(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionConfig, ConnectionRegistry};

    /// Appends a marker to text bodies so application order is observable.
    struct Suffix(&'static str);

    impl OutboundInterceptor for Suffix {
        fn name(&self) -> &'static str {
            self.0
        }

        fn intercept(&self, envelope: Envelope) -> Envelope {
            match envelope {
                Envelope::Text(body) => Envelope::Text(format!("{body}{}", self.0)),
                other => other,
            }
        }
    }

    fn channel_sink(
        config: &ConnectionConfig,
    ) -> (Outbound, tokio::sync::mpsc::Receiver<Envelope>) {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register("/ws", config);
        (Arc::new(ChannelSink::new(handle, config.send_timeout)), rx)
    }

    #[tokio::test]
    async fn channel_sink_enqueues_envelope() {
        let (sink, mut rx) = channel_sink(&ConnectionConfig::default());
        sink.send(Envelope::text("hello")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Envelope::text("hello")));
    }

    #[tokio::test]
    async fn channel_sink_reports_disconnect() {
        let (sink, rx) = channel_sink(&ConnectionConfig::default());
        drop(rx);
        let err = sink.send(Envelope::text("late")).await.unwrap_err();
        assert_eq!(err, SendError::Disconnected);
    }

    #[tokio::test]
    async fn interceptors_apply_in_list_order() {
        let (raw, mut rx) = channel_sink(&ConnectionConfig::default());
        let chain: Vec<Arc<dyn OutboundInterceptor>> = vec![Arc::new(Suffix("-a")), Arc::new(Suffix("-b"))];
        let sink = InterceptingSink::new(raw, chain);

        sink.send(Envelope::text("msg")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Envelope::text("msg-a-b")));
    }

    #[tokio::test]
    async fn intercepting_sink_preserves_send_order() {
        let (raw, mut rx) = channel_sink(&ConnectionConfig::default());
        let sink = InterceptingSink::new(raw, vec![Arc::new(Suffix("!")) as Arc<dyn OutboundInterceptor>]);

        for i in 0..50 {
            sink.send(Envelope::text(i.to_string())).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(rx.recv().await, Some(Envelope::text(format!("{i}!"))));
        }
    }

    #[test]
    fn debug_lists_interceptor_names() {
        let (raw, _rx) = channel_sink(&ConnectionConfig::default());
        let sink = InterceptingSink::new(raw, vec![Arc::new(Suffix("stamp")) as Arc<dyn OutboundInterceptor>]);
        assert!(format!("{sink:?}").contains("stamp"));
    }
}
