//! # Fluidity Server
//!
//! The remote half of the tunnel: accepts the agent's mTLS connection,
//! runs the responder side of the post-handshake auth exchange, then
//! hands the live [`TunnelSession`](tunnel_protocol::session::TunnelSession)
//! to the [`OriginExecutor`](fluidity_server::origin::OriginExecutor)
//! which dials the real origin for every tunneled request or CONNECT
//! (spec §4.3).
//!
//! One TLS accept loop serves every agent connection; each connection
//! gets its own session, so a tunnel failure on one agent never
//! affects another.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fluidity_server::auth::ExpectedMethodValidator;
use fluidity_server::config::ServerConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fluidity-server", about = "Remote responder half of a Fluidity tunnel")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(long, env = "FLUIDITY_CONFIG", default_value = "fluidity-server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = ServerConfig::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fluidity_server={}", cfg.log_level).into()),
        )
        .init();

    let validator = Arc::new(ExpectedMethodValidator::new(cfg.auth.expected_method.clone()));
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!(port = cfg.listen_port, "fluidity server listening for agent connections");

    let cancel = CancellationToken::new();
    let accept_cancel = cancel.clone();

    tokio::select! {
        res = fluidity_server::serve(listener, cfg, validator, accept_cancel) => {
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping");
            cancel.cancel();
        }
    }

    Ok(())
}
