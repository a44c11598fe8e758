//! Gateway configuration: credential source names and connection policy.

/// Configuration for the authentication and instrumentation layers.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Primary query parameter carrying a credential token.
    pub query_token_param: String,
    /// Fallback query parameter, consulted only when the primary is absent.
    pub query_token_alias: String,
    /// Case-sensitive scheme marker preceding the token in `Authorization`.
    pub header_scheme: String,
    /// Cookie holding the session key looked up in the session store.
    pub session_cookie_name: String,
    /// Key added to outbound JSON objects, holding server time in
    /// fractional seconds since the Unix epoch.
    pub timestamp_key: String,
    /// Whether the inner handler accepts connections that resolved to the
    /// anonymous identity. The middleware itself never rejects them.
    pub allow_anonymous: bool,
    /// Role an authenticated principal must carry to keep the channel open.
    /// Enforced by the inner handler, like `allow_anonymous`.
    pub required_role: Option<String>,
    /// Origins permitted to open a WebSocket. `"*"` permits any origin,
    /// including requests without an `Origin` header.
    pub allowed_origins: Vec<String>,
    /// Route serving the WebSocket upgrade.
    pub ws_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            query_token_param: "token".to_string(),
            query_token_alias: "auth_token".to_string(),
            header_scheme: "Token".to_string(),
            session_cookie_name: "sessionid".to_string(),
            timestamp_key: "server_timestamp".to_string(),
            allow_anonymous: true,
            required_role: None,
            allowed_origins: vec!["*".to_string()],
            ws_path: "/ws".to_string(),
        }
    }
}
