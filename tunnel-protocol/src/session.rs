//! # TunnelSession
//!
//! The symmetric Tunnel component (spec §4.2). Owns the single mTLS
//! connection, the `request_id -> InflightRequest` mapping, the
//! single-writer discipline, and the post-handshake auth exchange.
//!
//! Concurrency model (spec §5): one reader task decodes frames and
//! routes them to per-request inbound channels without ever blocking
//! on user code; one writer task drains a bounded outbound queue that
//! every other task (per-request consumers, the heartbeat, the auth
//! step) pushes onto. The `request_id -> InflightRequest` table lives
//! in a [`DashMap`], so lookups and inserts never hold a lock across
//! an `.await` — the anti-pattern spec §9 calls out (a mutex held
//! while blocked on network I/O) cannot arise because no code path
//! awaits while holding a map entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame};
use crate::config::SessionConfig;
use crate::envelope::{AuthMethod, Envelope, RequestId};
use crate::error::{ErrorCode, TunnelError};

/// Which side of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The agent: dials out, sends `auth_request`.
    Initiator,
    /// The server: accepts, validates and answers with `auth_response`.
    Responder,
}

/// Pluggable check the responder runs against an `auth_request` (spec
/// §1: "the concrete HTTP handlers... are external collaborators";
/// here the analogous seam is the credential validator).
#[async_trait::async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, method: &AuthMethod, credential: &[u8]) -> Result<(), String>;
}

/// Performs the initiator side of the post-handshake auth exchange
/// (spec §4.2): send exactly one `auth_request`, then await exactly
/// one `auth_response` within `deadline`.
pub async fn initiator_auth<S: AsyncRead + AsyncWrite + Unpin>(
    read: &mut ReadHalf<S>,
    write: &mut WriteHalf<S>,
    method: AuthMethod,
    credential: Vec<u8>,
    deadline: std::time::Duration,
    max_frame_size: usize,
) -> Result<(), TunnelError> {
    tokio::time::timeout(deadline, async {
        write_frame(write, &Envelope::AuthRequest { method, credential }, max_frame_size).await?;
        match read_frame(read, max_frame_size).await? {
            Envelope::AuthResponse { ok: true, .. } => Ok(()),
            Envelope::AuthResponse { ok: false, detail } => Err(TunnelError::AuthFailed(detail)),
            other => Err(TunnelError::ProtocolViolation(format!(
                "expected auth_response, got {}",
                other.kind_name()
            ))),
        }
    })
    .await
    .map_err(|_| TunnelError::AuthFailed("auth exchange timed out".into()))?
}

/// Performs the responder side: await exactly one `auth_request`,
/// validate it, reply with exactly one `auth_response`.
pub async fn responder_auth<S: AsyncRead + AsyncWrite + Unpin>(
    read: &mut ReadHalf<S>,
    write: &mut WriteHalf<S>,
    validator: &dyn AuthValidator,
    deadline: std::time::Duration,
    max_frame_size: usize,
) -> Result<(), TunnelError> {
    tokio::time::timeout(deadline, async {
        let envelope = read_frame(read, max_frame_size).await?;
        let (method, credential) = match envelope {
            Envelope::AuthRequest { method, credential } => (method, credential),
            other => {
                return Err(TunnelError::ProtocolViolation(format!(
                    "expected auth_request, got {}",
                    other.kind_name()
                )))
            }
        };
        match validator.validate(&method, &credential).await {
            Ok(()) => {
                write_frame(write, &Envelope::AuthResponse { ok: true, detail: String::new() }, max_frame_size)
                    .await?;
                Ok(())
            }
            Err(detail) => {
                write_frame(write, &Envelope::AuthResponse { ok: false, detail: detail.clone() }, max_frame_size)
                    .await?;
                Err(TunnelError::AuthFailed(detail))
            }
        }
    })
    .await
    .map_err(|_| TunnelError::AuthFailed("auth exchange timed out".into()))?
}

/// Per-request handle held by the session/reader: where to deliver
/// frames destined for this `request_id`.
struct InflightHandle {
    inbound_tx: mpsc::Sender<Envelope>,
}

/// Handed to the consumer (ProxyFrontend handler on the agent,
/// OriginExecutor on the server) for one logical request or CONNECT
/// tunnel (spec §3 `InflightRequest`).
pub struct InflightRequest {
    pub request_id: RequestId,
    pub inbound_rx: mpsc::Receiver<Envelope>,
    pub cancel: CancellationToken,
    session: Arc<TunnelSession>,
}

impl InflightRequest {
    /// Sends an envelope for this request onto the session's single
    /// outbound queue. Blocks (providing backpressure) if the queue is
    /// full, unless `cancel` fires first.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        self.session.send(envelope, &self.cancel).await
    }

    /// Removes this request from the session's table. Idempotent.
    /// Must be called by the consumer once the terminal condition
    /// (an `error` or a pair of `body_end`s) is reached (spec §3
    /// invariant 3) so the table does not grow unbounded.
    pub fn finish(&self) {
        self.session.inflight.remove(&self.request_id);
    }
}

/// A newly observed inbound request the responder's reader created
/// because no InflightRequest existed yet for that id (spec §4.2:
/// "or creates one for a new inbound `http_request`/`connect_request`
/// on the server").
pub struct IncomingRequest {
    pub opening: Envelope,
    pub request: InflightRequest,
}

pub struct TunnelSession {
    outbound_tx: mpsc::Sender<Envelope>,
    inflight: DashMap<RequestId, InflightHandle>,
    cfg: SessionConfig,
    pub peer_identity: String,
    pub role: Role,
    cancel: CancellationToken,
    alive: AtomicBool,
    last_rx: AsyncMutex<Instant>,
}

impl TunnelSession {
    /// Registers a new outbound request (spec: created by the
    /// initiator before it sends the opening envelope). The caller
    /// must send the opening `http_request`/`connect_request` itself.
    pub fn open(self: &Arc<Self>, request_id: RequestId) -> InflightRequest {
        let (tx, rx) = mpsc::channel(self.cfg.inbound_queue_capacity);
        self.inflight.insert(request_id, InflightHandle { inbound_tx: tx });
        InflightRequest {
            request_id,
            inbound_rx: rx,
            cancel: self.cancel.child_token(),
            session: self.clone(),
        }
    }

    /// Pushes an envelope onto the single outbound queue. This is the
    /// only way any task — including this session's own heartbeat —
    /// touches the connection; only the writer task drains the queue.
    pub async fn send(&self, envelope: Envelope, cancel: &CancellationToken) -> Result<(), TunnelError> {
        tokio::select! {
            res = self.outbound_tx.send(envelope) => {
                res.map_err(|_| TunnelError::TunnelLost("outbound queue closed".into()))
            }
            _ = cancel.cancelled() => Err(TunnelError::TunnelLost("cancelled".into())),
            _ = self.cancel.cancelled() => Err(TunnelError::TunnelLost("session closed".into())),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every InflightRequest and marks the session dead. Called
    /// once, by whichever task (reader, writer, heartbeat) first hits a
    /// fatal condition.
    fn teardown(&self, reason: &TunnelError) {
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!(peer = %self.peer_identity, %reason, "tunnel session tearing down");
            for entry in self.inflight.iter() {
                let _ = entry.value().inbound_tx.try_send(Envelope::Error {
                    request_id: *entry.key(),
                    code: ErrorCode::TunnelLost,
                    detail: reason.to_string(),
                });
            }
            self.inflight.clear();
            self.cancel.cancel();
        }
    }
}

/// Spawns the steady-state reader, writer and heartbeat tasks over an
/// already-authenticated stream (split into halves). Returns the
/// session handle, a receiver for newly observed inbound requests
/// (responder only — empty on the initiator), and a oneshot that
/// fires with the fatal error once the session tears down.
pub fn spawn<S>(
    read: ReadHalf<S>,
    write: WriteHalf<S>,
    cfg: SessionConfig,
    role: Role,
    peer_identity: String,
) -> (
    Arc<TunnelSession>,
    mpsc::Receiver<IncomingRequest>,
    tokio::sync::oneshot::Receiver<TunnelError>,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(cfg.outbound_queue_capacity);
    let (incoming_tx, incoming_rx) = mpsc::channel(cfg.incoming_queue_capacity);
    let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel();

    let session = Arc::new(TunnelSession {
        outbound_tx,
        inflight: DashMap::new(),
        cfg,
        peer_identity,
        role,
        cancel: CancellationToken::new(),
        alive: AtomicBool::new(true),
        last_rx: AsyncMutex::new(Instant::now()),
    });

    let fatal_tx = Arc::new(AsyncMutex::new(Some(fatal_tx)));

    let writer_session = session.clone();
    let writer_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = writer_loop(write, outbound_rx, writer_session.clone()).await {
            report_fatal(&writer_session, &writer_fatal, e).await;
        }
    });

    let reader_session = session.clone();
    let reader_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = reader_loop(read, reader_session.clone(), incoming_tx).await {
            report_fatal(&reader_session, &reader_fatal, e).await;
        }
    });

    let heartbeat_session = session.clone();
    let heartbeat_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = heartbeat_loop(heartbeat_session.clone()).await {
            report_fatal(&heartbeat_session, &heartbeat_fatal, e).await;
        }
    });

    (session, incoming_rx, fatal_rx)
}

async fn report_fatal(
    session: &Arc<TunnelSession>,
    fatal_tx: &Arc<AsyncMutex<Option<tokio::sync::oneshot::Sender<TunnelError>>>>,
    err: TunnelError,
) {
    session.teardown(&err);
    if let Some(tx) = fatal_tx.lock().await.take() {
        let _ = tx.send(err);
    }
}

async fn writer_loop<S: AsyncWrite + Unpin>(
    mut write: WriteHalf<S>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    session: Arc<TunnelSession>,
) -> Result<(), TunnelError> {
    while let Some(envelope) = outbound_rx.recv().await {
        write_frame(&mut write, &envelope, session.cfg.max_frame_size).await?;
    }
    Ok(())
}

async fn reader_loop<S: AsyncRead + Unpin>(
    mut read: ReadHalf<S>,
    session: Arc<TunnelSession>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
) -> Result<(), TunnelError> {
    loop {
        let envelope = read_frame(&mut read, session.cfg.max_frame_size).await?;
        *session.last_rx.lock().await = Instant::now();

        match &envelope {
            Envelope::Ping => {
                let _ = session.outbound_tx.try_send(Envelope::Pong);
                continue;
            }
            Envelope::Pong => continue,
            _ => {}
        }

        let Some(request_id) = envelope.request_id() else {
            debug!(kind = envelope.kind_name(), "dropping unexpected session-level envelope in steady state");
            continue;
        };

        if let Some(handle) = session.inflight.get(&request_id) {
            if handle.inbound_tx.try_send(envelope).is_err() {
                drop(handle);
                warn!(%request_id, "inbound channel overrun; failing request with backpressure_exceeded");
                if let Some((_, handle)) = session.inflight.remove(&request_id) {
                    let _ = handle.inbound_tx.try_send(Envelope::Error {
                        request_id,
                        code: ErrorCode::BackpressureExceeded,
                        detail: "consumer too slow".into(),
                    });
                }
            }
            continue;
        }

        // No existing InflightRequest: only legal for the responder,
        // and only to open a new request (spec §4.2).
        if session.role != Role::Responder {
            debug!(%request_id, kind = envelope.kind_name(), "ignoring frame for unknown request id");
            continue;
        }
        match &envelope {
            Envelope::HttpRequest { .. } | Envelope::ConnectRequest { .. } => {
                let (tx, rx) = mpsc::channel(session.cfg.inbound_queue_capacity);
                session.inflight.insert(request_id, InflightHandle { inbound_tx: tx });
                let request = InflightRequest {
                    request_id,
                    inbound_rx: rx,
                    cancel: session.cancel.child_token(),
                    session: session.clone(),
                };
                if incoming_tx.send(IncomingRequest { opening: envelope, request }).await.is_err() {
                    session.inflight.remove(&request_id);
                }
            }
            _ => {
                debug!(%request_id, kind = envelope.kind_name(), "frame for unknown request id, already completed");
            }
        }
    }
}

async fn heartbeat_loop(session: Arc<TunnelSession>) -> Result<(), TunnelError> {
    let mut ticker = tokio::time::interval(session.cfg.heartbeat_interval / 2);
    loop {
        ticker.tick().await;
        if !session.is_alive() {
            return Ok(());
        }
        let idle = session.last_rx.lock().await.elapsed();
        if idle >= session.cfg.heartbeat_timeout {
            return Err(TunnelError::HeartbeatTimeout);
        }
        if idle >= session.cfg.heartbeat_interval {
            let _ = session.outbound_tx.try_send(Envelope::Ping);
        }
    }
}
