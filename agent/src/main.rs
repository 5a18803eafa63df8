//! # Fluidity Agent
//!
//! The local forward-proxy half of the tunnel: accepts standard
//! HTTP-proxy traffic on a loopback port ([`proxy::ProxyFrontend`]),
//! drives the remote server's lifecycle ([`lifecycle::LifecycleController`]
//! — discover → wake → poll-ready → dial+handshake → authenticate →
//! serve → reconnect-with-backoff) and feeds it a live [`TunnelSession`]
//! to serve requests against.
//!
//! [`TunnelSession`]: tunnel_protocol::session::TunnelSession

use std::path::PathBuf;

use clap::Parser;
use fluidity_agent::config::AgentConfig;
use fluidity_agent::{lifecycle, proxy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fluidity-agent", about = "Local forward-proxy half of a Fluidity tunnel")]
struct Cli {
    /// Path to the agent's TOML configuration file.
    #[arg(long, env = "FLUIDITY_CONFIG", default_value = "fluidity-agent.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = AgentConfig::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fluidity_agent={}", cfg.log_level).into()),
        )
        .init();

    info!(listen_port = cfg.listen_port, "starting fluidity agent");

    let origin_timeout = cfg.timeouts.origin_request();
    let listen_port = cfg.listen_port;
    let handle = lifecycle::spawn(cfg)?;

    let frontend = proxy::ProxyFrontend::new(handle.sessions.clone(), origin_timeout, handle.cancellation_token());

    tokio::select! {
        res = frontend.serve(listen_port) => {
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping");
        }
    }

    handle.stop().await;
    Ok(())
}
