//! Server lifecycle with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener, and
//! `serve()` accepts connections until the shutdown future resolves.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use wsgate_core::{CloseReason, Envelope};

use super::config::{NetworkConfig, TlsConfig};
use super::connection::ConnectionRegistry;
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, ws_upgrade_handler, AppState,
    ChannelHandler,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::gateway::{Gateway, GatewayConfig};

/// Owns the listener and the state shared by all connections.
pub struct NetworkModule {
    config: NetworkConfig,
    gateway_config: GatewayConfig,
    gateway: Gateway,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding a port.
    #[must_use]
    pub fn new(config: NetworkConfig, gateway_config: GatewayConfig, gateway: Gateway) -> Self {
        Self {
            config,
            gateway_config,
            gateway,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router:
    ///
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET {ws_path}` WebSocket upgrade through the gateway pipeline
    pub fn build_router(&self) -> Router {
        router(
            &self.config,
            &self.gateway_config,
            self.gateway.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown),
        )
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then closes every open WebSocket
    /// with `1001` and waits up to `drain_timeout` for them to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();

        let registry = Arc::clone(&self.registry);
        let controller = Arc::clone(&self.shutdown);
        let on_shutdown = async move {
            shutdown.await;
            begin_drain(&registry, &controller);
        };

        self.shutdown.set_ready();

        match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, on_shutdown).await?,
            None => {
                info!("serving plain HTTP/WS");
                axum::serve(listener, router)
                    .with_graceful_shutdown(on_shutdown)
                    .await?;
            }
        }

        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all connections drained");
        } else {
            warn!(
                open = self.shutdown.open_connections(),
                "drain timeout expired with connections still open"
            );
        }
        Ok(())
    }
}

/// Builds the application router around shared state.
pub fn router(
    config: &NetworkConfig,
    gateway_config: &GatewayConfig,
    gateway: Gateway,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
) -> Router {
    let state = AppState {
        registry,
        shutdown,
        config: Arc::new(config.clone()),
        gateway,
        handler: ChannelHandler::from_config(gateway_config),
        gateway_config: Arc::new(gateway_config.clone()),
        start_time: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route(&gateway_config.ws_path, get(ws_upgrade_handler))
        .layer(build_http_layers(config))
        .with_state(state)
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    on_shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .context("failed to load TLS certificates")?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        on_shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(std_listener, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Flips to draining and asks every open socket to close.
fn begin_drain(registry: &ConnectionRegistry, controller: &ShutdownController) {
    controller.trigger_shutdown();

    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!(count = handles.len(), "closing open connections");
    }
    for handle in handles {
        if !handle.is_connected() {
            continue;
        }
        if let Err(e) = handle.try_send(Envelope::close(CloseReason::GOING_AWAY, "server shutting down")) {
            debug!(conn_id = handle.id.0, error = %e, "close frame not queued; waiting for drain timeout");
        }
    }
}
