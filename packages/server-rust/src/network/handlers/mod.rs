//! axum handlers and the state they share.

pub mod channel;
pub mod health;
pub mod websocket;

pub use channel::ChannelHandler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use websocket::{origin_allowed, ws_upgrade_handler, SessionIdentity};

use std::sync::Arc;
use std::time::Instant;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::gateway::{Gateway, GatewayConfig};

/// Shared state extracted by every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Authentication and instrumentation layers applied to every socket.
    pub gateway: Gateway,
    /// Inner handler served behind `gateway`.
    pub handler: ChannelHandler,
    pub gateway_config: Arc<GatewayConfig>,
    pub start_time: Instant,
}
