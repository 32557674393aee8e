//! Vantage Agent
//!
//! The device-side process: enrolls once against the broker, then
//! maintains a persistent WebSocket session - register, heartbeat,
//! dispatch - reconnecting forever on any failure. Screen capture and
//! input injection are delegated to platform tools.

mod capture;
mod config;
mod conn;
mod enroll;
mod error;
mod input;
mod runtime;
mod sysinfo;

use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::runtime::Agent;

/// Pause between connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "vantage-agent")]
#[command(version, about = "Vantage agent - remote desktop endpoint")]
struct Args {
    /// Server URL (e.g. https://server:8443).
    #[arg(long, env = "VANTAGE_SERVER")]
    server: Option<String>,

    /// Enrollment code for initial registration.
    #[arg(long, value_name = "CODE")]
    enroll: Option<String>,

    /// Agent name (defaults to the hostname).
    #[arg(long)]
    name: Option<String>,

    /// Skip TLS certificate verification (development only).
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vantage_agent=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "starting vantage-agent"
    );

    let cfg = if let Some(code) = &args.enroll {
        let Some(server) = &args.server else {
            bail!("--server is required for enrollment");
        };
        info!(server = %server, "enrolling with server");

        let cfg = enroll::enroll(server, code, args.name.as_deref(), args.insecure).await?;
        config::save(&cfg)?;
        info!(
            agent_id = %cfg.agent_id,
            path = %config::config_path().display(),
            "enrolled successfully"
        );
        cfg
    } else {
        match config::load() {
            Ok(cfg) => cfg,
            Err(_) => bail!("not enrolled; run with --server <url> --enroll <code>"),
        }
    };

    info!(server = %cfg.server_url, "server configured");

    let agent = Agent::new(cfg, args.name, args.insecure)?;
    loop {
        if let Err(e) = agent.run().await {
            warn!(error = %e, "connection error");
        }
        info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
