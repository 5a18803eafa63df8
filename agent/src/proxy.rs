//! # ProxyFrontend
//!
//! Loopback HTTP/1.1 forward-proxy front-end (spec §4.1). Accepts
//! absolute-form requests and `CONNECT`, strips hop-by-hop headers,
//! hands each request to the live Tunnel as an envelope pair, and
//! streams the response back onto the client socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_protocol::envelope::{Envelope, HeaderMap, RequestId};
use tunnel_protocol::error::ErrorCode;
use tunnel_protocol::session::TunnelSession;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const CLIENT_BODY_CHUNK: usize = 32 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyFrontend {
    sessions: watch::Receiver<Option<Arc<TunnelSession>>>,
    origin_timeout: Duration,
    cancel: CancellationToken,
}

impl ProxyFrontend {
    pub fn new(
        sessions: watch::Receiver<Option<Arc<TunnelSession>>>,
        origin_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { sessions, origin_timeout, cancel }
    }

    pub async fn serve(self, listen_port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
        self.serve_on(listener).await
    }

    /// Same as [`serve`](Self::serve) but over an already-bound
    /// listener, so a caller that needs to know the actual port (tests
    /// binding to `127.0.0.1:0`) can read it back before serving.
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(port = listener.local_addr()?.port(), "proxy frontend listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let sessions = self.sessions.clone();
                    let origin_timeout = self.origin_timeout;
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, sessions, origin_timeout, cancel).await {
                            debug!(%peer, error = %e, "proxy connection ended");
                        }
                    });
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    sessions: watch::Receiver<Option<Arc<TunnelSession>>>,
    origin_timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(socket);
    loop {
        let head = match read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()), // client closed between requests
            Err(e) => {
                // Spec §4.1: malformed proxy input gets a local 400,
                // never reaches the Tunnel.
                let _ = write_simple_status(reader.get_mut(), 400, "Bad Request").await;
                return Err(e);
            }
        };

        let session = match sessions.borrow().clone() {
            Some(s) if s.is_alive() => s,
            _ => {
                write_simple_status(reader.get_mut(), 503, "Service Unavailable").await?;
                return Ok(());
            }
        };

        let keep_alive = !head.wants_close();

        if head.method.eq_ignore_ascii_case("CONNECT") {
            handle_connect(&mut reader, &head, &session, &cancel).await?;
            return Ok(());
        }

        let origin_wants_close = handle_http_request(&mut reader, &head, &session, origin_timeout, &cancel).await?;
        if !keep_alive || origin_wants_close {
            return Ok(());
        }
    }
}

struct RequestHead {
    method: String,
    target: String,
    headers: HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
    client_wants_close: bool,
}

impl RequestHead {
    fn wants_close(&self) -> bool {
        self.client_wants_close
    }
}

/// Reads and parses one request's header block, bounded by
/// `MAX_HEADER_BYTES`. Returns `None` on a clean EOF before any bytes
/// of a new request arrive (keep-alive connection closed by client).
async fn read_request_head(reader: &mut BufReader<TcpStream>) -> anyhow::Result<Option<RequestHead>> {
    let mut buf = Vec::new();
    let mut first = true;
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return if first { Ok(None) } else { Err(anyhow::anyhow!("truncated request head")) };
        }
        first = false;
        buf.extend_from_slice(&line);
        if buf.len() > MAX_HEADER_BYTES {
            anyhow::bail!("request head too large");
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(&buf).map_err(|e| anyhow::anyhow!("malformed request: {e}"))?;
    if status.is_partial() {
        anyhow::bail!("incomplete request head");
    }

    let method = req.method.ok_or_else(|| anyhow::anyhow!("missing method"))?.to_string();
    let target = req.path.ok_or_else(|| anyhow::anyhow!("missing target"))?.to_string();

    let mut headers = HeaderMap::new();
    for h in req.headers.iter() {
        headers.insert(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    // Spec §4.1: strip `Connection` and the tokens it names, not just
    // the fixed hop-by-hop set. Captured before stripping, since
    // `client_wants_close` needs the client's own framing intent.
    let client_wants_close = headers
        .get("connection")
        .map(|values| values.iter().any(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close"))))
        .unwrap_or(false);
    if let Some(values) = headers.get("connection") {
        let named: Vec<String> = values
            .iter()
            .flat_map(|v| v.split(','))
            .map(|tok| tok.trim().to_string())
            .filter(|tok| !tok.is_empty())
            .collect();
        for token in &named {
            headers.remove(token);
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let chunked = req
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding") && String::from_utf8_lossy(h.value).to_ascii_lowercase().contains("chunked"));

    Ok(Some(RequestHead { method, target, headers, content_length, chunked, client_wants_close }))
}

/// Handles one HTTP request/response pair on the client connection.
/// Returns whether the caller should close the client connection after
/// this response (the origin's response had no `Content-Length` and
/// wasn't chunked, so the only way the client can tell where the body
/// ends is a close — spec §4.1's "honour Content-Length and chunked
/// termination correctly" implies the read-until-EOF case must close).
async fn handle_http_request(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    session: &Arc<TunnelSession>,
    origin_timeout: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let request_id = RequestId::new();
    let inflight = session.open(request_id);

    let small_body = match head.content_length {
        Some(len) if len as usize <= CLIENT_BODY_CHUNK => {
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body).await?;
            Some(body)
        }
        _ => None,
    };

    if inflight
        .send(Envelope::HttpRequest {
            request_id,
            method: head.method.clone(),
            url: head.target.clone(),
            headers: head.headers.clone(),
            body: small_body.clone(),
        })
        .await
        .is_err()
    {
        write_simple_status(reader.get_mut(), 502, "Bad Gateway").await?;
        inflight.finish();
        return Ok(true);
    }

    if small_body.is_none() {
        stream_request_body(reader, head, &inflight).await?;
    }

    let mut inflight = inflight;
    let mut headers_sent = false;
    let mut should_close = false;
    let result = tokio::time::timeout(origin_timeout, async {
        loop {
            match inflight.inbound_rx.recv().await {
                Some(Envelope::HttpResponse { status, headers, body }) => {
                    // The origin executor sets `connection: close` itself
                    // when it couldn't frame the response any other way
                    // (no Content-Length, not chunked) — honour it here
                    // rather than keeping this client connection alive for
                    // a request whose body boundary we can't actually see.
                    should_close = headers
                        .get_first("connection")
                        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close")))
                        .unwrap_or(false);
                    write_response_head(reader.get_mut(), status, &headers).await?;
                    headers_sent = true;
                    if let Some(body) = body {
                        reader.get_mut().write_all(&body).await?;
                    }
                }
                Some(Envelope::BodyChunk { data, .. }) => {
                    reader.get_mut().write_all(&data).await?;
                }
                Some(Envelope::BodyEnd { .. }) => return Ok(()),
                Some(Envelope::Error { code, detail, .. }) => {
                    warn!(?code, %detail, "origin request failed");
                    return Err(code);
                }
                Some(_) => continue,
                None => return Err(ErrorCode::TunnelLost),
            }
        }
    })
    .await;

    inflight.finish();
    match result {
        Ok(Ok(())) => Ok(should_close),
        // Spec §7 partial-write semantics: if headers already went out,
        // the status line is committed; just stop writing rather than
        // send a second (invalid) status line.
        Ok(Err(_)) if headers_sent => Ok(should_close),
        Ok(Err(code)) => {
            write_simple_status(reader.get_mut(), code.http_status(), reason_phrase(code.http_status())).await?;
            Ok(true)
        }
        Err(_) if headers_sent => Ok(should_close),
        Err(_) => {
            write_simple_status(reader.get_mut(), 504, "Gateway Timeout").await?;
            Ok(true)
        }
    }
}

async fn stream_request_body(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    inflight: &tunnel_protocol::session::InflightRequest,
) -> anyhow::Result<()> {
    if head.chunked {
        loop {
            let mut size_line = Vec::new();
            read_line(reader, &mut size_line).await?;
            let size_str = String::from_utf8_lossy(&size_line);
            let size = u64::from_str_radix(size_str.trim().split(';').next().unwrap_or("0"), 16)
                .map_err(|_| anyhow::anyhow!("malformed chunk size"))?;
            if size == 0 {
                let mut trailer = Vec::new();
                read_line(reader, &mut trailer).await?;
                break;
            }
            let mut chunk = vec![0u8; size as usize];
            reader.read_exact(&mut chunk).await?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await?;
            let _ = inflight.send(Envelope::BodyChunk { request_id: inflight.request_id, data: chunk }).await;
        }
    } else if let Some(len) = head.content_length {
        let mut remaining = len;
        while remaining > 0 {
            let chunk_len = remaining.min(CLIENT_BODY_CHUNK as u64) as usize;
            let mut buf = vec![0u8; chunk_len];
            reader.read_exact(&mut buf).await?;
            remaining -= chunk_len as u64;
            let _ = inflight.send(Envelope::BodyChunk { request_id: inflight.request_id, data: buf }).await;
        }
    }
    let _ = inflight.send(Envelope::BodyEnd { request_id: inflight.request_id }).await;
    Ok(())
}

async fn read_line(reader: &mut BufReader<TcpStream>, out: &mut Vec<u8>) -> anyhow::Result<()> {
    let n = reader.read_until(b'\n', out).await?;
    if n == 0 {
        anyhow::bail!("eof mid chunked body");
    }
    if out.len() > MAX_HEADER_BYTES {
        anyhow::bail!("chunk line too large");
    }
    Ok(())
}

async fn handle_connect(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    session: &Arc<TunnelSession>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (host, port) = match head.target.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap_or(443)),
        None => (head.target.clone(), 443),
    };

    let request_id = RequestId::new();
    let inflight = session.open(request_id);
    if inflight.send(Envelope::ConnectRequest { request_id, host, port }).await.is_err() {
        write_simple_status(reader.get_mut(), 502, "Bad Gateway").await?;
        inflight.finish();
        return Ok(());
    }

    let mut inflight = inflight;
    match inflight.inbound_rx.recv().await {
        Some(Envelope::TunnelReady { .. }) => {}
        Some(Envelope::Error { code, detail, .. }) => {
            inflight.finish();
            warn!(?code, %detail, "connect rejected");
            return write_simple_status(reader.get_mut(), code.http_status(), reason_phrase(code.http_status())).await;
        }
        _ => {
            inflight.finish();
            return write_simple_status(reader.get_mut(), 502, "Bad Gateway").await;
        }
    }

    reader.get_mut().write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    pipe_connect(reader, &mut inflight, cancel).await;
    inflight.finish();
    Ok(())
}

/// Bidirectional opaque byte pump for an established CONNECT tunnel
/// (spec §4.2: "the consumer on each side pipes them to its attached
/// TCP"). Closes on whichever direction finishes first.
async fn pipe_connect(
    reader: &mut BufReader<TcpStream>,
    inflight: &mut tunnel_protocol::session::InflightRequest,
    cancel: &CancellationToken,
) {
    let request_id = inflight.request_id;
    let mut client_buf = [0u8; CLIENT_BODY_CHUNK];
    loop {
        tokio::select! {
            n = reader.read(&mut client_buf) => {
                match n {
                    Ok(0) | Err(_) => {
                        let _ = inflight.send(Envelope::BodyEnd { request_id }).await;
                        return;
                    }
                    Ok(n) => {
                        if inflight.send(Envelope::BodyChunk { request_id, data: client_buf[..n].to_vec() }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            frame = inflight.inbound_rx.recv() => {
                match frame {
                    Some(Envelope::BodyChunk { data, .. }) => {
                        if reader.get_mut().write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Some(Envelope::BodyEnd { .. }) | None => return,
                    Some(Envelope::Error { code, .. }) => {
                        debug!(?code, "connect tunnel torn down by remote error");
                        return;
                    }
                    _ => continue,
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn write_response_head(socket: &mut TcpStream, status: u16, headers: &HeaderMap) -> anyhow::Result<()> {
    let reason = reason_phrase(status);
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    socket.write_all(head.as_bytes()).await?;
    Ok(())
}

async fn write_simple_status(socket: &mut TcpStream, status: u16, reason: &str) -> anyhow::Result<()> {
    let body = format!("{status} {reason}");
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

