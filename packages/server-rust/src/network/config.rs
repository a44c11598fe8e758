//! Listener and per-connection transport settings.

use std::path::PathBuf;
use std::time::Duration;

/// Listener configuration for the gateway server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick a port.
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub connection: ConnectionConfig,
    /// Origins allowed by the CORS layer on plain HTTP routes.
    pub cors_origins: Vec<String>,
    /// Upper bound on plain HTTP request handling. WebSocket sessions are
    /// not subject to it once upgraded.
    pub request_timeout: Duration,
    /// How long shutdown waits for open connections to finish.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// PEM certificate and key for the rustls acceptor.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Per-connection channel sizes and timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound channel feeding the write loop.
    pub outbound_channel_capacity: usize,
    /// Capacity of the inbound channel feeding the inner handler.
    pub inbound_channel_capacity: usize,
    /// How long a send may wait on a full outbound channel.
    pub send_timeout: Duration,
    pub ws_write_buffer_size: usize,
    pub ws_max_write_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            inbound_channel_capacity: 64,
            send_timeout: Duration::from_secs(5),
            ws_write_buffer_size: 131_072,     // 128 KB
            ws_max_write_buffer_size: 524_288, // 512 KB
        }
    }
}
