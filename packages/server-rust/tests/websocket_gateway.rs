//! End-to-end tests against a bound server using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use axum::extract::Request;
use axum::middleware::{self, Next};
use wsgate_core::{Identity, ManualClock, Principal};
use wsgate_server::gateway::{Gateway, GatewayConfig};
use wsgate_server::network::module::router;
use wsgate_server::network::{
    ConnectionRegistry, NetworkConfig, NetworkModule, SessionIdentity, ShutdownController,
};
use wsgate_server::store::InMemoryCredentialStore;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn test_gateway(gateway_config: &GatewayConfig) -> Gateway {
    let credentials = InMemoryCredentialStore::new();
    credentials.insert("abc123", Principal::new("42"));
    Gateway::new(
        gateway_config,
        Arc::new(credentials),
        None,
        Arc::new(ManualClock::new(1_700_000_000_500)),
    )
}

impl TestServer {
    async fn start(gateway_config: GatewayConfig) -> Self {
        let gateway = test_gateway(&gateway_config);
        let network_config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            drain_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        };

        let mut module = NetworkModule::new(network_config, gateway_config, gateway);
        let port = module.start().await.unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(module.serve(async move {
            let _ = stopped.await;
        }));

        Self {
            port,
            stop: Some(stop),
            task,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("ws://127.0.0.1:{}{path_and_query}", self.port)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return text.as_str().to_owned();
        }
    }
}

async fn next_close_code(client: &mut Client) -> Option<u16> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

const GREETING_42: &str = r#"{"type":"connection_established","user_id":"42","authenticated":true,"server_timestamp":1700000000.5}"#;
const GREETING_ANON: &str = r#"{"type":"connection_established","user_id":null,"authenticated":false,"server_timestamp":1700000000.5}"#;

#[tokio::test]
async fn query_token_authenticates_and_greeting_is_stamped() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let (mut client, _) = connect_async(server.url("/ws?token=abc123")).await.unwrap();
    assert_eq!(next_text(&mut client).await, GREETING_42);

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn query_alias_authenticates() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let (mut client, _) = connect_async(server.url("/ws?auth_token=abc123")).await.unwrap();
    assert_eq!(next_text(&mut client).await, GREETING_42);

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn header_token_authenticates() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let mut request = server.url("/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Token abc123".parse().unwrap());
    let (mut client, _) = connect_async(request).await.unwrap();
    assert_eq!(next_text(&mut client).await, GREETING_42);

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_token_connects_as_anonymous() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let (mut client, _) = connect_async(server.url("/ws?token=wrong")).await.unwrap();
    assert_eq!(next_text(&mut client).await, GREETING_ANON);

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn ping_reply_carries_client_and_server_timestamps() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let (mut client, _) = connect_async(server.url("/ws?token=abc123")).await.unwrap();
    next_text(&mut client).await;

    client
        .send(Message::text(r#"{"type":"ping","timestamp":123}"#))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"type":"pong","timestamp":123,"server_timestamp":1700000000.5}"#
    );

    client
        .send(Message::text(r#"{"type":"status_update","id":7}"#))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"type":"echo","payload":{"type":"status_update","id":7},"server_timestamp":1700000000.5}"#
    );

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn anonymous_closed_with_4401_when_denied() {
    let server = TestServer::start(GatewayConfig {
        allow_anonymous: false,
        ..GatewayConfig::default()
    })
    .await;

    let (mut client, _) = connect_async(server.url("/ws")).await.unwrap();
    assert_eq!(next_close_code(&mut client).await, Some(4401));

    server.shutdown().await;
}

#[tokio::test]
async fn disallowed_origin_is_rejected_before_upgrade() {
    let server = TestServer::start(GatewayConfig {
        allowed_origins: vec!["https://app.example.com".to_string()],
        ..GatewayConfig::default()
    })
    .await;

    let mut request = server.url("/ws?token=abc123").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(ORIGIN, "https://evil.example.com".parse().unwrap());
    let err = connect_async(request).await.unwrap_err();
    assert!(matches!(err, WsError::Http(ref response) if response.status() == 403));

    let mut request = server.url("/ws?token=abc123").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(ORIGIN, "https://app.example.com".parse().unwrap());
    let (mut client, _) = connect_async(request).await.unwrap();
    assert_eq!(next_text(&mut client).await, GREETING_42);

    client.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_open_sessions_with_going_away() {
    let server = TestServer::start(GatewayConfig::default()).await;

    let (mut client, _) = connect_async(server.url("/ws?token=abc123")).await.unwrap();
    next_text(&mut client).await;

    let shutdown = tokio::spawn(server.shutdown());
    assert_eq!(next_close_code(&mut client).await, Some(1001));
    // Drive the client so its close reply reaches the server.
    while client.next().await.is_some() {}

    shutdown.await.unwrap();
}

/// Stands in for upstream session middleware that has already logged the
/// request in.
async fn attach_session(mut request: Request, next: Next) -> axum::response::Response {
    request
        .extensions_mut()
        .insert(SessionIdentity(Identity::Authenticated(Principal::new("7"))));
    next.run(request).await
}

#[tokio::test]
async fn upstream_session_takes_precedence_over_tokens() {
    let gateway_config = GatewayConfig::default();
    let network_config = NetworkConfig::default();
    let app = router(
        &network_config,
        &gateway_config,
        test_gateway(&gateway_config),
        Arc::new(ConnectionRegistry::new()),
        Arc::new(ShutdownController::new()),
    )
    .layer(middleware::from_fn(attach_session));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut request = format!("ws://127.0.0.1:{port}/ws?token=abc123")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Token abc123".parse().unwrap());
    let (mut client, _) = connect_async(request).await.unwrap();
    assert_eq!(
        next_text(&mut client).await,
        r#"{"type":"connection_established","user_id":"7","authenticated":true,"server_timestamp":1700000000.5}"#
    );

    client.close(None).await.unwrap();
    server.abort();
}
