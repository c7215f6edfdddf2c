//! agentlink Relay Server
//!
//! Accepts desktop agent sockets and forwards tool calls to them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use agentlink_core::config::load_config;
use agentlink_core::tracing_init::init_tracing;

use agentlink_relay::AgentRelay;
use agentlink_relay::auth::JwtManager;
use agentlink_relay::server::build_router;
use agentlink_relay::storage::RelayDatabase;

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Parser, Debug)]
#[command(name = "agentlink-relay")]
#[command(
    version,
    about = "agentlink relay server - desktop agent connections and tool calls"
)]
struct Args {
    /// Configuration file (JSON), layered over the global one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on. Overrides the configuration.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JWT secret key.
    #[arg(long, env = "AGENTLINK_JWT_SECRET", default_value = DEV_SECRET, hide_env_values = true)]
    jwt_secret: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("agentlink_relay=info", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    let addr = config.server.addr;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting agentlink-relay"
    );
    if args.jwt_secret == DEV_SECRET {
        warn!("Using the development JWT secret; set AGENTLINK_JWT_SECRET in production");
    }

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening relay database");
    let db = RelayDatabase::open(&db_path).await?;

    let jwt = JwtManager::new(
        args.jwt_secret.as_bytes(),
        &config.auth.issuer,
        config.auth.access_ttl_secs,
    );

    let relay = Arc::new(AgentRelay::new(config, jwt, db));
    relay.start().await;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Relay server listening");

    // Agent sockets are closed before the listener drains.
    let stopping = Arc::clone(&relay);
    axum::serve(listener, build_router(relay))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            stopping.stop().await;
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".agentlink").join("relay.db"))
}
