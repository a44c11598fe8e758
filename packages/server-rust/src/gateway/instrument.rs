//! Instrumentation layer: records connection establishment and stamps
//! outbound JSON objects with the server time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Number;
use tower::{Layer, Service};
use tracing::{debug, trace};
use wsgate_core::{ClockSource, Envelope, FrameKind};

use super::context::TransportKind;
use super::sink::{InterceptingSink, OutboundInterceptor};
use super::Connection;

/// A top-level JSON object whose member values keep their original text.
///
/// Numbers, strings and nested structures are never re-encoded, so values
/// outside the range of `f64` or `u64` survive byte for byte. A repeated
/// key keeps its first position and takes the last value.
struct RawObject(Vec<(String, Box<RawValue>)>);

impl RawObject {
    fn insert(&mut self, key: &str, value: Box<RawValue>) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }
}

impl<'de> Deserialize<'de> for RawObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawObjectVisitor;

        impl<'de> Visitor<'de> for RawObjectVisitor {
            type Value = RawObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RawObject, A::Error> {
                let mut members: Vec<(String, Box<RawValue>)> = Vec::new();
                let mut positions: HashMap<String, usize> = HashMap::new();
                while let Some((key, value)) = access.next_entry::<String, Box<RawValue>>()? {
                    if let Some(&at) = positions.get(&key) {
                        members[at].1 = value;
                    } else {
                        positions.insert(key.clone(), members.len());
                        members.push((key, value));
                    }
                }
                Ok(RawObject(members))
            }
        }

        deserializer.deserialize_map(RawObjectVisitor)
    }
}

impl Serialize for RawObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Inserts `key` holding `secs` into `body` when it parses as a JSON object.
///
/// Returns `None` for anything else (arrays, scalars, invalid JSON), in
/// which case the caller forwards the original text untouched. An existing
/// `key` is overwritten in place; other members keep their order and their
/// exact source text.
#[must_use]
pub fn stamp_json(body: &str, key: &str, secs: f64) -> Option<String> {
    let Ok(mut object) = serde_json::from_str::<RawObject>(body) else {
        return None;
    };
    let stamp = Number::from_f64(secs)?;
    object.insert(key, RawValue::from_string(stamp.to_string()).ok()?);
    serde_json::to_string(&object).ok()
}

// ---------------------------------------------------------------------------
// TimestampInterceptor
// ---------------------------------------------------------------------------

/// Outbound interceptor adding the server timestamp to JSON text frames.
pub struct TimestampInterceptor {
    clock: Arc<dyn ClockSource>,
    key: String,
}

impl TimestampInterceptor {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, key: impl Into<String>) -> Self {
        Self {
            clock,
            key: key.into(),
        }
    }
}

impl OutboundInterceptor for TimestampInterceptor {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn intercept(&self, envelope: Envelope) -> Envelope {
        if envelope.kind() == FrameKind::Control {
            return envelope;
        }
        let body = match envelope {
            Envelope::Text(body) => body,
            other => {
                metrics::counter!("wsgate_messages_unstamped_total").increment(1);
                return other;
            }
        };
        match stamp_json(&body, &self.key, self.clock.now_secs_f64()) {
            Some(stamped) => {
                metrics::counter!("wsgate_messages_stamped_total").increment(1);
                Envelope::Text(stamped)
            }
            None => {
                metrics::counter!("wsgate_messages_unstamped_total").increment(1);
                trace!("outbound text is not a JSON object, forwarding unchanged");
                Envelope::Text(body)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments WebSocket connections.
#[derive(Clone)]
pub struct InstrumentLayer {
    clock: Arc<dyn ClockSource>,
    timestamp_key: Arc<str>,
}

impl InstrumentLayer {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, timestamp_key: &str) -> Self {
        Self {
            clock,
            timestamp_key: Arc::from(timestamp_key),
        }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService {
            inner,
            clock: Arc::clone(&self.clock),
            timestamp_key: Arc::clone(&self.timestamp_key),
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentService
// ---------------------------------------------------------------------------

/// Service wrapper that decorates the outbound sink before the inner service runs.
#[derive(Clone)]
pub struct InstrumentService<S> {
    inner: S,
    clock: Arc<dyn ClockSource>,
    timestamp_key: Arc<str>,
}

impl<S> Service<Connection> for InstrumentService<S>
where
    S: Service<Connection>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut conn: Connection) -> Self::Future {
        if conn.ctx.kind != TransportKind::WebSocket {
            return self.inner.call(conn);
        }

        let now = self.clock.now_millis();
        conn.ctx.mark_established(now);
        debug!(conn_id = conn.ctx.id.0, established_at = now, "connection instrumented");

        let stamp: Arc<dyn OutboundInterceptor> = Arc::new(TimestampInterceptor::new(
            Arc::clone(&self.clock),
            self.timestamp_key.as_ref(),
        ));
        conn.outbound = Arc::new(InterceptingSink::new(conn.outbound, vec![stamp]));
        self.inner.call(conn)
    }
}
