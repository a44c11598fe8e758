//! wsgate server: an axum WebSocket gateway that resolves one identity per
//! connection from session, query or header credentials, and stamps
//! outbound JSON messages with the server time.

pub mod gateway;
pub mod network;
pub mod observability;
pub mod store;

pub use gateway::{Connection, Gateway, GatewayConfig, GatewayError};
pub use network::NetworkModule;
