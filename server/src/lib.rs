//! Library surface for the Fluidity server.
//!
//! The binary target (`src/main.rs`) parses config and calls [`serve`];
//! splitting the accept loop out here lets integration tests drive it
//! against a listener bound to an ephemeral port instead of a fixed
//! one from a config file.

pub mod auth;
pub mod config;
pub mod origin;
pub mod tls;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_protocol::breaker::CircuitBreakerRegistry;
use tunnel_protocol::session::{responder_auth, spawn as spawn_session, AuthValidator, Role};

use crate::config::ServerConfig;
use crate::origin::OriginExecutor;

/// Runs the mTLS accept loop against an already-bound `listener` until
/// `cancel` fires. Every accepted connection gets its own TLS
/// handshake, post-handshake auth exchange, [`TunnelSession`](tunnel_protocol::session::TunnelSession)
/// and [`OriginExecutor`], so one agent's tunnel failure never affects
/// another.
pub async fn serve(
    listener: TcpListener,
    cfg: ServerConfig,
    validator: Arc<dyn AuthValidator>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = tls::build_acceptor(&cfg.mtls)?;
    let executor = OriginExecutor::new(
        CircuitBreakerRegistry::new(cfg.breaker.to_breaker_config()),
        cfg.timeouts.origin_dial_timeouts(),
        cfg.timeouts.origin_timeouts(),
    );

    let tls_handshake_timeout = cfg.timeouts.tls_handshake();
    let session_cfg = cfg.timeouts.session_config();
    let cfg_identity = cfg.mtls.expected_client_identity.clone();

    loop {
        let (tcp, peer_addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let acceptor = acceptor.clone();
        let validator = validator.clone();
        let executor = executor.clone();
        let auth_deadline = session_cfg.auth_deadline;
        let expected_identity = cfg_identity.clone();

        tokio::spawn(async move {
            let tls_stream = match tokio::time::timeout(tls_handshake_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(%peer_addr, error = %e, "mTLS handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%peer_addr, "mTLS handshake timed out");
                    return;
                }
            };

            // The acceptor's client-cert verifier already pinned the
            // presented certificate's CN/SAN to this value (spec §4.2);
            // reuse it as the authenticated peer identity rather than
            // re-deriving anything from the certificate here.
            let peer_identity = expected_identity;

            let (mut read, mut write) = tokio::io::split(tls_stream);
            if let Err(e) = responder_auth(&mut read, &mut write, validator.as_ref(), auth_deadline, session_cfg.max_frame_size).await {
                warn!(%peer_addr, error = %e, "post-handshake auth rejected");
                return;
            }

            let (session, incoming, fatal_rx) = spawn_session(read, write, session_cfg, Role::Responder, peer_identity.clone());
            info!(%peer_addr, identity = %peer_identity, "agent authenticated, tunnel session established");

            tokio::spawn(executor.serve(incoming));

            if let Ok(err) = fatal_rx.await {
                warn!(%peer_addr, %err, "tunnel session torn down");
            }
            let _ = session.is_alive();
        });
    }
}
