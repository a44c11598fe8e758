//! wsgate-server: WebSocket gateway with token/session authentication and
//! server-timestamped outbound messages.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use wsgate_core::{ClockSource, CredentialStore, SessionStore, SystemClock};
use wsgate_server::gateway::{Gateway, GatewayConfig};
use wsgate_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use wsgate_server::observability::{init_tracing, install_metrics_exporter};
use wsgate_server::store::{
    ChainedCredentialStore, InMemoryCredentialStore, InMemorySessionStore, JwtCredentialStore,
};

#[derive(Parser, Debug)]
#[command(name = "wsgate-server")]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, env = "WSGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "WSGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// PEM certificate; enables TLS together with `--tls-key`
    #[arg(long, env = "WSGATE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "WSGATE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// WebSocket route
    #[arg(long, env = "WSGATE_WS_PATH", default_value = "/ws")]
    ws_path: String,

    /// JSON object mapping token to principal
    #[arg(long, env = "WSGATE_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// JSON object mapping session key to `{principal, expires_at}`
    #[arg(long, env = "WSGATE_SESSIONS_FILE")]
    sessions_file: Option<PathBuf>,

    /// HS256 secret; accepts signed JWTs as credential tokens
    #[arg(long, env = "WSGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Close connections that resolve to the anonymous identity (4401)
    #[arg(long, env = "WSGATE_DENY_ANONYMOUS")]
    deny_anonymous: bool,

    /// Role authenticated principals must hold (4403 otherwise)
    #[arg(long, env = "WSGATE_REQUIRED_ROLE")]
    required_role: Option<String>,

    /// Allowed WebSocket origins; `*` allows any
    #[arg(long, env = "WSGATE_ALLOWED_ORIGINS", value_delimiter = ',', default_value = "*")]
    allowed_origins: Vec<String>,

    /// Prometheus listener address, e.g. `0.0.0.0:9100`
    #[arg(long, env = "WSGATE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long, env = "WSGATE_LOG_JSON")]
    log_json: bool,
}

fn credential_store(args: &Args) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let mut stores: Vec<Arc<dyn CredentialStore>> = Vec::new();
    if let Some(secret) = &args.jwt_secret {
        stores.push(Arc::new(JwtCredentialStore::new_hs256(secret.as_bytes())));
    }
    if let Some(path) = &args.credentials_file {
        let store = InMemoryCredentialStore::from_file(path)?;
        info!(tokens = store.len(), "loaded credentials");
        stores.push(Arc::new(store));
    }
    if stores.is_empty() {
        info!("no credential source configured; every token resolves to anonymous");
    }
    Ok(Arc::new(ChainedCredentialStore::new(stores)))
}

fn session_store(
    args: &Args,
    clock: Arc<dyn ClockSource>,
) -> anyhow::Result<Option<Arc<dyn SessionStore>>> {
    let Some(path) = &args.sessions_file else {
        return Ok(None);
    };
    let store = InMemorySessionStore::from_file(path, clock)?;
    info!(sessions = store.len(), "loaded sessions");
    Ok(Some(Arc::new(store)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    if let Some(addr) = args.metrics_addr {
        install_metrics_exporter(addr)?;
        info!(%addr, "metrics exporter listening");
    }

    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let gateway_config = GatewayConfig {
        allow_anonymous: !args.deny_anonymous,
        required_role: args.required_role.clone(),
        allowed_origins: args.allowed_origins.clone(),
        ws_path: args.ws_path.clone(),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(
        &gateway_config,
        credential_store(&args)?,
        session_store(&args, Arc::clone(&clock))?,
        clock,
    );

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }),
        _ => None,
    };
    let network_config = NetworkConfig {
        host: args.host.clone(),
        port: args.port,
        tls,
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(network_config, gateway_config, gateway);
    let port = module.start().await.context("failed to start listener")?;
    info!(port, "wsgate-server ready");

    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
