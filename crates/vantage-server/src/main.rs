//! Vantage Server
//!
//! The broker that mediates between long-lived remote agents and
//! short-lived browser viewers: enrollment, credential verification,
//! WebSocket session brokerage, and TLS provisioning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vantage_crypto::{generate_api_key, Platform};

use vantage_server::registry::Registry;
use vantage_server::server::{build_router, serve, AppState};
use vantage_server::storage::{ApiKey, SqliteStore, Store};
use vantage_server::tls::TlsMode;

#[derive(Parser, Debug)]
#[command(name = "vantage-server")]
#[command(version, about = "Vantage server - remote agent and viewer broker")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8443", env = "VANTAGE_ADDR")]
    addr: SocketAddr,

    /// Dashboard assets directory (served as static files if set).
    #[arg(long, env = "VANTAGE_WEB_DIR")]
    web: Option<PathBuf>,

    /// Data directory for the database, identity key, and certificates.
    #[arg(long, default_value = "data", env = "VANTAGE_DATA_DIR")]
    data: PathBuf,

    /// Run without TLS (development only).
    #[arg(long)]
    insecure: bool,

    /// Obtain certificates via ACME for this domain (repeatable).
    #[arg(long, value_name = "DOMAIN")]
    acme: Vec<String>,

    /// Path to a custom TLS certificate (PEM). Requires --key.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to the custom TLS private key (PEM). Requires --cert.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vantage_server=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "starting vantage-server"
    );

    std::fs::create_dir_all(&args.data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&args.data, std::fs::Permissions::from_mode(0o700))?;
    }

    let platform = Arc::new(Platform::load_or_generate(&args.data)?);
    info!(fingerprint = %platform.fingerprint(), "platform identity ready");

    let tls_mode = select_tls_mode(&args);
    let tls = tls_mode.build()?;
    let ca_cert_path = tls.paths.as_ref().map(|paths| paths.ca_cert.clone());

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&args.data.join("platform.db")).await?);
    ensure_admin_key(store.as_ref()).await?;

    let state = AppState {
        store,
        platform,
        registry: Arc::new(Registry::new()),
        ca_cert_path,
    };

    let mut router = build_router(state);
    if let Some(web_dir) = &args.web {
        info!(dir = %web_dir.display(), "serving dashboard assets");
        router = router.fallback_service(tower_http::services::ServeDir::new(web_dir));
    }

    let scheme = if tls.acceptor.is_some() { "https" } else { "http" };
    info!("dashboard: {scheme}://localhost:{}", args.addr.port());

    let listener = TcpListener::bind(args.addr).await?;
    tokio::select! {
        result = serve(listener, router, tls.acceptor) => result?,
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }

    info!("server stopped");
    Ok(())
}

fn select_tls_mode(args: &Args) -> TlsMode {
    if args.insecure {
        TlsMode::Off
    } else if !args.acme.is_empty() {
        TlsMode::Acme {
            domains: args.acme.clone(),
            cache_dir: args.data.join("acme-certs"),
        }
    } else if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        TlsMode::Custom {
            cert: cert.clone(),
            key: key.clone(),
        }
    } else {
        TlsMode::SelfSigned {
            data_dir: args.data.clone(),
        }
    }
}

/// First-run setup: if no API key exists, mint the initial admin key and
/// print it once.
async fn ensure_admin_key(store: &dyn Store) -> anyhow::Result<()> {
    if !store.list_api_keys().await?.is_empty() {
        return Ok(());
    }

    let grant = generate_api_key("admin");
    store
        .create_api_key(&ApiKey {
            id: grant.id.clone(),
            name: grant.name.clone(),
            key_hash: grant.key_hash.clone(),
            prefix: grant.prefix.clone(),
            created_at: grant.created_at,
            last_used: None,
        })
        .await?;

    info!("==========================================================");
    info!("  INITIAL ADMIN API KEY (save this - shown only once):");
    info!("  {}", grant.raw_key);
    info!("==========================================================");
    Ok(())
}
