//! Transport: listener lifecycle, connection registry, HTTP middleware,
//! WebSocket upgrade and shutdown control.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use handlers::{AppState, ChannelHandler, SessionIdentity};
pub use module::NetworkModule;
pub use shutdown::*;
