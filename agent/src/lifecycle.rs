//! # LifecycleController
//!
//! Drives the discover → wake → query → dial → authenticate → connected
//! state machine (spec §4.4). External collaborators: the control-plane
//! client ([`crate::control`]) and the Tunnel ([`tunnel_protocol::session`]).
//!
//! Resolution of an ambiguity the response schema in §6 leaves open:
//! the table names a `Waking -> Dialing` transition "on `already_running`
//! with address", but the Wake response shape carries no address field
//! at all (only Query's `ready` response does, via `public_ip`). This
//! implementation treats every non-`negative` Wake outcome uniformly —
//! `already_running`/`starting`/`waking`/`scaling` all advance to
//! `Polling` and the address is always obtained from a subsequent
//! `ready` Query. A Query that already reports `ready` on first poll
//! (the natural shape of "already running") reaches `Dialing` in one
//! round trip, which satisfies the table's intent without inventing a
//! field the wire contract does not define.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::split;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_protocol::breaker::{BreakerCallError, CircuitBreakerRegistry};
use tunnel_protocol::retry::retry;
use tunnel_protocol::session::{initiator_auth, spawn as spawn_session, Role, TunnelSession};
use tunnel_protocol::TunnelError;

use crate::config::AgentConfig;
use crate::control::{ControlPlaneClient, QueryStatus, WakeStatus};
use crate::persist;
use crate::tls::build_connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Waking,
    Polling,
    Dialing,
    Authenticating,
    Connected,
    Reconnecting,
}

pub struct LifecycleHandle {
    pub sessions: watch::Receiver<Option<Arc<TunnelSession>>>,
    pub states: watch::Receiver<LifecycleState>,
    cancel: CancellationToken,
    control: ControlPlaneClient,
    kill_timeout: Duration,
}

impl LifecycleHandle {
    /// Token that tracks this controller's shutdown. Other components
    /// (the proxy frontend's accept loop) should derive a child token
    /// from this so a single `stop()` tears both down together.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the controller. Kill is best-effort and fire-and-forget
    /// (spec §4.4): a failed Kill call never blocks shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Err(e) = self.control.kill(self.kill_timeout).await {
            warn!(error = %e, "kill call failed (advisory, ignoring)");
        }
    }
}

struct Controller {
    cfg: AgentConfig,
    control: ControlPlaneClient,
    breakers: CircuitBreakerRegistry,
    cancel: CancellationToken,
    session_tx: watch::Sender<Option<Arc<TunnelSession>>>,
    state_tx: watch::Sender<LifecycleState>,
    state_file: Option<PathBuf>,
}

pub fn spawn(cfg: AgentConfig) -> anyhow::Result<LifecycleHandle> {
    let (connector, server_name) = build_connector(&cfg.mtls)?;
    let control = ControlPlaneClient::new(cfg.control_plane.clone());
    let breakers = CircuitBreakerRegistry::new(cfg.breaker.to_breaker_config());
    let cancel = CancellationToken::new();
    let (session_tx, session_rx) = watch::channel(None);
    let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);

    let handle = LifecycleHandle {
        sessions: session_rx,
        states: state_rx,
        cancel: cancel.clone(),
        control: control.clone(),
        kill_timeout: cfg.timeouts.control_plane_timeouts().query,
    };

    let state_file = cfg.state_file.clone();
    let controller = Controller { cfg, control, breakers, cancel, session_tx, state_tx, state_file };
    tokio::spawn(async move { controller.run(connector, server_name).await });

    Ok(handle)
}

impl Controller {
    fn set_state(&self, state: LifecycleState) {
        let _ = self.state_tx.send(state);
    }

    async fn run(self, connector: tokio_rustls::TlsConnector, server_name: ServerName<'static>) {
        let mut cached_ip = self
            .state_file
            .as_deref()
            .map(persist::load)
            .and_then(|s| s.public_ip);
        let mut attempt: u32 = 0;
        let retry_cfg = self.cfg.retry.to_retry_config();
        let cpt = self.cfg.timeouts.control_plane_timeouts();

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(LifecycleState::Idle);
                return;
            }

            let address = match self.discover_address(&mut cached_ip, &retry_cfg, cpt).await {
                Ok(addr) => addr,
                Err(_) => {
                    self.backoff(&mut attempt, &retry_cfg).await;
                    continue;
                }
            };

            let session = match self.dial_and_authenticate(&connector, &server_name, &address).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, %address, "dial/authenticate failed");
                    self.backoff(&mut attempt, &retry_cfg).await;
                    continue;
                }
            };

            attempt = 0;
            cached_ip = Some(address.clone());
            if let Some(path) = &self.state_file {
                persist::save(path, &persist::PersistedState { public_ip: Some(address.clone()) });
            }
            self.set_state(LifecycleState::Connected);
            let _ = self.session_tx.send(Some(session.clone()));
            info!(%address, "tunnel connected");

            let fatal = session.cancellation_token();
            tokio::select! {
                _ = fatal.cancelled() => {}
                _ = self.cancel.cancelled() => {
                    let _ = self.session_tx.send(None);
                    self.set_state(LifecycleState::Idle);
                    return;
                }
            }
            let _ = self.session_tx.send(None);
            warn!("tunnel torn down, reconnecting");
            self.set_state(LifecycleState::Reconnecting);
            self.backoff(&mut attempt, &retry_cfg).await;
        }
    }

    async fn backoff(&self, attempt: &mut u32, retry_cfg: &tunnel_protocol::retry::RetryConfig) {
        self.set_state(LifecycleState::Reconnecting);
        let delay = retry_cfg.backoff(*attempt);
        *attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Resolves the remote server address to dial: a configured static
    /// address, the cached warm-start `public_ip`, or a fresh
    /// Wake + Query round trip.
    /// Appends the configured mTLS port unless `host` already names one.
    fn with_port(&self, host: &str) -> String {
        if host.rsplit(':').next().map(|p| p.parse::<u16>().is_ok()).unwrap_or(false) {
            host.to_string()
        } else {
            format!("{host}:{}", self.cfg.remote_port)
        }
    }

    async fn discover_address(
        &self,
        cached_ip: &mut Option<String>,
        retry_cfg: &tunnel_protocol::retry::RetryConfig,
        cpt: tunnel_protocol::config::ControlPlaneTimeouts,
    ) -> Result<String, TunnelError> {
        if let Some(addr) = &self.cfg.remote_addr {
            return Ok(self.with_port(addr));
        }
        if let Some(ip) = cached_ip.take() {
            return Ok(self.with_port(&ip));
        }

        self.set_state(LifecycleState::Waking);
        let control = self.control.clone();
        let wake_timeout = cpt.wake_attempt;
        let cancel = self.cancel.clone();
        let wake = retry(*retry_cfg, &cancel, |_: &TunnelError| true, || {
            let control = control.clone();
            async move { control.wake(None, None, wake_timeout).await }
        })
        .await?;

        if wake.status == WakeStatus::Scaling {
            info!(instance_id = ?wake.instance_id, "server scaling, waiting for ready instance");
        }
        let instance_id = wake.instance_id.ok_or_else(|| {
            TunnelError::ProtocolViolation("wake response missing instance_id".into())
        })?;

        let host = self.poll_until_ready(&instance_id, cpt).await?;
        Ok(self.with_port(&host))
    }

    async fn poll_until_ready(
        &self,
        instance_id: &str,
        cpt: tunnel_protocol::config::ControlPlaneTimeouts,
    ) -> Result<String, TunnelError> {
        self.set_state(LifecycleState::Polling);
        let deadline = Instant::now() + cpt.max_poll_duration;
        let mut interval = cpt.poll_interval_initial;

        for _ in 0..self.cfg.max_polls {
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    return Err(TunnelError::TunnelLost("cancelled while polling".into()));
                }
            }
            let resp = self.control.query(instance_id, cpt.query).await?;
            match resp.status {
                QueryStatus::Ready => {
                    return resp
                        .public_ip
                        .ok_or_else(|| TunnelError::ProtocolViolation("query ready without public_ip".into()));
                }
                QueryStatus::Pending => {
                    interval = (interval * 2).min(cpt.poll_interval_max);
                }
                QueryStatus::Negative => {
                    return Err(TunnelError::TunnelLost("query reported negative".into()));
                }
            }
        }
        Err(TunnelError::TunnelLost("max polls exceeded without ready".into()))
    }

    async fn dial_and_authenticate(
        &self,
        connector: &tokio_rustls::TlsConnector,
        server_name: &ServerName<'static>,
        address: &str,
    ) -> Result<Arc<TunnelSession>, TunnelError> {
        self.set_state(LifecycleState::Dialing);
        let dial_timeouts = self.cfg.timeouts.dial_timeouts();
        let breaker = self.breakers.get(address);
        let connector = connector.clone();
        let server_name = server_name.clone();
        let address = address.to_string();

        let tls_stream = breaker
            .call(|| async move {
                let socket_addr = tokio::net::lookup_host(&address)
                    .await
                    .map_err(|e| TunnelError::TunnelLost(format!("resolving {address}: {e}")))?
                    .next()
                    .ok_or_else(|| TunnelError::TunnelLost(format!("no addresses for {address}")))?;
                let tcp = tokio::time::timeout(dial_timeouts.dial, TcpStream::connect(socket_addr))
                    .await
                    .map_err(|_| TunnelError::TunnelLost("dial timeout".into()))?
                    .map_err(|e| TunnelError::TunnelLost(format!("dial failed: {e}")))?;
                tokio::time::timeout(dial_timeouts.tls_handshake, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| TunnelError::TunnelLost("tls handshake timeout".into()))?
                    .map_err(|e| TunnelError::TunnelLost(format!("tls handshake failed: {e}")))
            })
            .await
            .map_err(|e| match e {
                BreakerCallError::Open => TunnelError::TunnelLost("circuit open for transport dial".into()),
                BreakerCallError::Inner(e) => e,
            })?;

        self.set_state(LifecycleState::Authenticating);
        let (read, write) = split(tls_stream);
        let (mut read, mut write) = (read, write);
        let credential = std::fs::read(&self.cfg.auth.credential_path)
            .map_err(|e| TunnelError::AuthFailed(format!("reading credential file: {e}")))?;
        let session_cfg = self.cfg.timeouts.session_config();

        initiator_auth(
            &mut read,
            &mut write,
            self.cfg.auth.method.clone(),
            credential,
            session_cfg.auth_deadline,
            session_cfg.max_frame_size,
        )
        .await?;

        let (session, _incoming, fatal_rx) = spawn_session(read, write, session_cfg, Role::Initiator, address);
        let session_for_fatal = session.clone();
        tokio::spawn(async move {
            if let Ok(err) = fatal_rx.await {
                warn!(%err, "tunnel session reported fatal error");
            }
            let _ = session_for_fatal.is_alive();
        });
        Ok(session)
    }
}
