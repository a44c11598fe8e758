//! Reference inner handler run behind the gateway layers.
//!
//! Applies the connection policy (anonymous access, required role), greets
//! the client, answers `ping` and echoes any other JSON object.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::{json, Map, Value};
use tower::Service;
use tracing::{debug, info};
use wsgate_core::{CloseReason, Envelope};

use crate::gateway::{Connection, GatewayConfig, GatewayError};

/// Channel handler enforcing the access policy from [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    allow_anonymous: bool,
    required_role: Option<String>,
}

impl ChannelHandler {
    #[must_use]
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            allow_anonymous,
            required_role: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            allow_anonymous: config.allow_anonymous,
            required_role: config.required_role.clone(),
        }
    }

    /// Requires authenticated principals to carry `role`.
    #[must_use]
    pub fn with_required_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    /// Close frame to send instead of serving, if the connection is refused.
    fn refusal(&self, conn: &Connection) -> Option<Envelope> {
        match conn.ctx.principal() {
            None if !self.allow_anonymous => Some(Envelope::close(
                CloseReason::UNAUTHENTICATED,
                "authentication required",
            )),
            Some(principal) => match &self.required_role {
                Some(role) if !principal.has_role(role) => {
                    Some(Envelope::close(CloseReason::FORBIDDEN, "insufficient permissions"))
                }
                _ => None,
            },
            None => None,
        }
    }

    async fn serve(self, conn: Connection) -> Result<(), GatewayError> {
        if let Some(close) = self.refusal(&conn) {
            info!(conn_id = conn.ctx.id.0, "connection refused by channel policy");
            conn.outbound.send(close).await?;
            return Ok(());
        }

        let Connection {
            ctx,
            outbound,
            mut inbound,
        } = conn;

        let principal = ctx.principal();
        outbound
            .send(Envelope::json(&json!({
                "type": "connection_established",
                "user_id": principal.map(|p| p.id.clone()),
                "authenticated": principal.is_some(),
            })))
            .await?;

        while let Some(envelope) = inbound.recv().await {
            let Envelope::Text(body) = envelope else {
                continue;
            };
            match serde_json::from_str::<Value>(&body) {
                Ok(Value::Object(message)) => {
                    outbound.send(Envelope::json(&reply_to(message))).await?;
                }
                _ => debug!(conn_id = ctx.id.0, "ignoring non-object text frame"),
            }
        }
        Ok(())
    }
}

/// `ping` gets a `pong` carrying the client's timestamp back; anything else is echoed.
fn reply_to(message: Map<String, Value>) -> Value {
    if message.get("type").and_then(Value::as_str) == Some("ping") {
        json!({
            "type": "pong",
            "timestamp": message.get("timestamp").cloned().unwrap_or(Value::Null),
        })
    } else {
        json!({ "type": "echo", "payload": message })
    }
}

impl Service<Connection> for ChannelHandler {
    type Response = ();
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, conn: Connection) -> Self::Future {
        Box::pin(self.clone().serve(conn))
    }
}
