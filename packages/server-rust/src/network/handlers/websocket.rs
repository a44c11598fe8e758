//! WebSocket upgrade handler and per-connection read/write loops.
//!
//! Each upgraded socket is split: the write loop drains the connection's
//! outbound channel onto the wire, the read loop forwards client frames to
//! the inner handler. The gateway pipeline runs between the two.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::ORIGIN;
use axum::http::{Extensions, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn, Instrument};
use wsgate_core::{CloseReason, Envelope, Identity};

use super::AppState;
use crate::gateway::{ChannelSink, Connection, ConnectionContext, GatewayError, TransportKind};

/// Request extension carrying an identity established by upstream session
/// middleware. When present it takes precedence over every credential token.
#[derive(Debug, Clone)]
pub struct SessionIdentity(pub Identity);

/// Whether `origin` may open a WebSocket under `allowed`.
///
/// `"*"` admits everything, including a missing header. Otherwise the
/// header must match one entry exactly, ignoring ASCII case.
#[must_use]
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.iter().any(|o| o == "*") {
        return true;
    }
    origin.is_some_and(|origin| allowed.iter().any(|o| o.eq_ignore_ascii_case(origin)))
}

/// Validates the origin and upgrades the request.
///
/// Returns `403` for a rejected origin and `503` once shutdown has begun.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.gateway_config.allowed_origins, origin) {
        warn!(origin = origin.unwrap_or("<none>"), "rejected WebSocket origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let session = extensions.get::<SessionIdentity>().map(|s| s.0.clone());
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();
    let write_buffer = state.config.connection.ws_write_buffer_size;
    let max_write_buffer = state.config.connection.ws_max_write_buffer_size;

    ws.write_buffer_size(write_buffer)
        .max_write_buffer_size(max_write_buffer)
        .on_upgrade(move |socket| handle_socket(socket, state, path, query, headers, session))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    path: String,
    query: String,
    headers: HeaderMap,
    session: Option<Identity>,
) {
    let _guard = state.shutdown.connection_guard();
    let conn_config = state.config.connection.clone();
    let (handle, outbound_rx) = state.registry.register(&path, &conn_config);
    let conn_id = handle.id;
    let span = tracing::info_span!("connection", conn_id = conn_id.0, path = %path);

    async move {
        info!("WebSocket connection opened");

        let closed = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(conn_config.inbound_channel_capacity);
        let (ws_tx, ws_rx) = socket.split();

        let writer = tokio::spawn(write_loop(ws_tx, outbound_rx).in_current_span());
        let reader = tokio::spawn(read_loop(ws_rx, inbound_tx, closed.clone()).in_current_span());

        let ctx = ConnectionContext::new(conn_id, TransportKind::WebSocket, path, query, headers)
            .with_session(session)
            .with_close_signal(closed.clone());
        let conn = Connection {
            ctx,
            outbound: Arc::new(ChannelSink::new(Arc::clone(&handle), conn_config.send_timeout)),
            inbound: inbound_rx,
        };

        match state.gateway.pipeline(state.handler.clone()).oneshot(conn).await {
            Ok(()) => debug!("handler finished"),
            Err(GatewayError::ClosedDuringAuth) => {
                debug!("peer closed before authentication completed");
            }
            Err(e) => warn!(error = %e, "handler failed"),
        }

        // Dropping the last sender ends the write loop after it flushes.
        state.registry.remove(conn_id);
        let lifetime = handle.connected_at.elapsed();
        drop(handle);
        if writer.await.is_err() {
            warn!("write loop panicked");
        }
        closed.cancel();
        reader.abort();

        info!(?lifetime, "WebSocket connection closed");
    }
    .instrument(span)
    .await;
}

/// Forwards outbound envelopes to the socket until the channel closes or a
/// close frame is written.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let is_close = matches!(envelope, Envelope::Close(_));
        if let Err(e) = ws_tx.send(to_message(envelope)).await {
            debug!(error = %e, "socket write failed");
            return;
        }
        if is_close {
            return;
        }
    }
    let _ = ws_tx.close().await;
}

/// Forwards client frames to the inner handler; signals closure when the
/// peer goes away.
async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Envelope>,
    closed: CancellationToken,
) {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(message) => {
                if inbound.send(from_message(message)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "socket read failed");
                break;
            }
        }
    }
    closed.cancel();
}

/// Converts an outbound envelope into an axum WebSocket message.
#[must_use]
pub fn to_message(envelope: Envelope) -> Message {
    match envelope {
        Envelope::Text(body) => Message::Text(body.into()),
        Envelope::Binary(data) => Message::Binary(data),
        Envelope::Ping(data) => Message::Ping(data),
        Envelope::Pong(data) => Message::Pong(data),
        Envelope::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

/// Converts an inbound axum WebSocket message into an envelope.
#[must_use]
pub fn from_message(message: Message) -> Envelope {
    match message {
        Message::Text(body) => Envelope::Text(body.as_str().to_owned()),
        Message::Binary(data) => Envelope::Binary(data),
        Message::Ping(data) => Envelope::Ping(data),
        Message::Pong(data) => Envelope::Pong(data),
        Message::Close(frame) => Envelope::Close(
            frame.map(|f| CloseReason::new(f.code, f.reason.as_str())),
        ),
    }
}
