//! # OriginExecutor
//!
//! Server-side half of every tunneled request (spec §4.3). Consumes
//! [`IncomingRequest`]s observed by the responder's [`TunnelSession`]
//! reader, dials the real origin behind a per-target circuit breaker,
//! and streams the response (or CONNECT bytes) back over the same
//! `request_id`.
//!
//! Origin dials go through [`CircuitBreakerRegistry`] only, not the
//! retry-with-backoff kit: a single proxied HTTP request is not safely
//! retryable without knowing whether it's idempotent (spec §4.3 only
//! names the breaker for this path; retry is reserved for the control
//! plane and transport dial on the agent side, spec §4.4/§4.5).

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;
use tunnel_protocol::breaker::{BreakerCallError, CircuitBreakerRegistry};
use tunnel_protocol::config::{DialTimeouts, OriginTimeouts};
use tunnel_protocol::envelope::{Envelope, HeaderMap};
use tunnel_protocol::error::ErrorCode;
use tunnel_protocol::session::{IncomingRequest, InflightRequest};

const ORIGIN_CHUNK: usize = 32 * 1024;
const INLINE_THRESHOLD: usize = 32 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct OriginExecutor {
    breakers: CircuitBreakerRegistry,
    dial_timeouts: DialTimeouts,
    origin_timeouts: OriginTimeouts,
}

impl OriginExecutor {
    pub fn new(breakers: CircuitBreakerRegistry, dial_timeouts: DialTimeouts, origin_timeouts: OriginTimeouts) -> Arc<Self> {
        Arc::new(Self { breakers, dial_timeouts, origin_timeouts })
    }

    /// Drains a responder session's stream of newly observed inbound
    /// requests, spawning one task per request so a slow origin never
    /// blocks any other in-flight request on the same tunnel.
    pub async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<IncomingRequest>) {
        while let Some(incoming_request) = incoming.recv().await {
            let executor = self.clone();
            tokio::spawn(async move {
                executor.handle(incoming_request).await;
            });
        }
    }

    async fn handle(&self, incoming: IncomingRequest) {
        let IncomingRequest { opening, mut request } = incoming;
        match opening {
            Envelope::HttpRequest { method, url, headers, body, .. } => {
                self.execute_http(&mut request, method, url, headers, body).await;
            }
            Envelope::ConnectRequest { host, port, .. } => {
                self.execute_connect(&mut request, host, port).await;
            }
            other => {
                warn!(kind = other.kind_name(), "origin executor received unexpected opening envelope");
            }
        }
        request.finish();
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ErrorCode> {
        let key = format!("{host}:{port}");
        let breaker = self.breakers.get(&key);
        let dial_timeout = self.dial_timeouts.dial;
        let host = host.to_string();

        breaker
            .call(|| async move {
                let addr = tokio::time::timeout(dial_timeout, tokio::net::lookup_host((host.as_str(), port)))
                    .await
                    .map_err(|_| ErrorCode::Timeout)?
                    .map_err(|_| ErrorCode::DnsFailure)?
                    .next()
                    .ok_or(ErrorCode::DnsFailure)?;
                match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(classify_connect_error(&e)),
                    Err(_) => Err(ErrorCode::Timeout),
                }
            })
            .await
            .map_err(|e| match e {
                BreakerCallError::Open => ErrorCode::CircuitOpen,
                BreakerCallError::Inner(code) => code,
            })
    }

    async fn execute_http(&self, request: &mut InflightRequest, method: String, url: String, headers: HeaderMap, body: Option<Vec<u8>>) {
        let (host, port, path) = match split_origin_url(&url) {
            Ok(parts) => parts,
            Err(_) => {
                send_error(request, ErrorCode::OriginError, "malformed request url").await;
                return;
            }
        };

        let origin = match self.dial(&host, port).await {
            Ok(stream) => stream,
            Err(code) => {
                send_error(request, code, "origin dial failed").await;
                return;
            }
        };

        let result = tokio::time::timeout(
            self.origin_timeouts.origin_request,
            run_http_exchange(origin, &method, &path, &headers, body, request),
        )
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(code)) => send_error(request, code, "origin request failed").await,
            Err(_) => send_error(request, ErrorCode::Timeout, "origin request timed out").await,
        }
    }

    async fn execute_connect(&self, request: &mut InflightRequest, host: String, port: u16) {
        let origin = match self.dial(&host, port).await {
            Ok(stream) => stream,
            Err(code) => {
                send_error(request, code, "connect to origin failed").await;
                return;
            }
        };

        if request.send(Envelope::TunnelReady { request_id: request.request_id }).await.is_err() {
            return;
        }

        pipe_connect(origin, request).await;
    }
}

fn classify_connect_error(e: &std::io::Error) -> ErrorCode {
    match e.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => ErrorCode::ConnectRefused,
        _ => ErrorCode::OriginError,
    }
}

fn split_origin_url(url: &str) -> anyhow::Result<(String, u16, String)> {
    let parsed = url::Url::parse(url)?;
    let host = parsed.host_str().ok_or_else(|| anyhow::anyhow!("missing host"))?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);
    let mut path = parsed.path().to_string();
    if let Some(q) = parsed.query() {
        path.push('?');
        path.push_str(q);
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok((host, port, path))
}

async fn send_error(request: &InflightRequest, code: ErrorCode, detail: &str) {
    let _ = request.send(Envelope::Error { request_id: request.request_id, code, detail: detail.to_string() }).await;
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    chunked: bool,
}

/// Writes the request head + body to `origin`, reads back the response
/// head, and streams `http_response`/`body_chunk`/`body_end` over the
/// tunnel. Errors are returned (not sent) so the caller maps the
/// partial-write case itself (spec §7: headers already sent to the
/// client when the origin fails mid-body).
async fn run_http_exchange(
    origin: TcpStream,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    inline_body: Option<Vec<u8>>,
    request: &mut InflightRequest,
) -> Result<(), ErrorCode> {
    let (origin_read, mut origin_write) = tokio::io::split(origin);
    let mut origin_read = BufReader::new(origin_read);

    let content_length = headers.get_first("content-length").and_then(|v| v.parse::<u64>().ok());
    let chunked_request = content_length.is_none();
    write_request_head(&mut origin_write, method, path, headers, chunked_request).await.map_err(|_| ErrorCode::OriginError)?;

    match inline_body {
        Some(body) => write_body_chunk(&mut origin_write, &body, chunked_request).await.map_err(|_| ErrorCode::OriginError)?,
        None => stream_request_body_to_origin(&mut origin_write, request, chunked_request).await.map_err(|_| ErrorCode::OriginError)?,
    }
    if chunked_request {
        origin_write.write_all(b"0\r\n\r\n").await.map_err(|_| ErrorCode::OriginError)?;
    }

    let head = read_response_head(&mut origin_read).await.map_err(|_| ErrorCode::OriginError)?;

    let mut response_headers = HeaderMap::new();
    for (name, value) in &head.headers {
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        response_headers.insert(name, value.clone());
    }
    // The origin's own `Transfer-Encoding`/`Connection` are stripped above
    // (the tunnel reframes the body via `body_chunk`/`body_end` regardless
    // of how the origin framed it). When the origin gave us neither a
    // `Content-Length` nor `chunked` framing, the only way it signals the
    // end of the body is closing its socket — there's no envelope for
    // that, so tell the proxy client to close too once this response ends.
    if head.content_length.is_none() && !head.chunked {
        response_headers.insert("connection", "close".to_string());
    }

    let small_body = match head.content_length {
        Some(len) if (len as usize) <= INLINE_THRESHOLD => {
            let mut buf = vec![0u8; len as usize];
            origin_read.read_exact(&mut buf).await.map_err(|_| ErrorCode::OriginError)?;
            Some(buf)
        }
        _ => None,
    };

    request
        .send(Envelope::HttpResponse { request_id: request.request_id, status: head.status, headers: response_headers, body: small_body.clone() })
        .await
        .map_err(|_| ErrorCode::TunnelLost)?;

    if small_body.is_none() {
        stream_origin_body_to_tunnel(&mut origin_read, &head, request).await?;
    }
    request.send(Envelope::BodyEnd { request_id: request.request_id }).await.map_err(|_| ErrorCode::TunnelLost)?;
    Ok(())
}

async fn write_request_head(
    write: &mut WriteHalf<TcpStream>,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    chunked_request: bool,
) -> std::io::Result<()> {
    let mut head = format!("{method} {path} HTTP/1.1\r\n");
    let mut saw_host = false;
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !saw_host {
        head.push_str("host: origin\r\n");
    }
    head.push_str("connection: close\r\n");
    if chunked_request {
        head.push_str("transfer-encoding: chunked\r\n");
    }
    head.push_str("\r\n");
    write.write_all(head.as_bytes()).await
}

async fn write_body_chunk(write: &mut WriteHalf<TcpStream>, data: &[u8], chunked: bool) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if chunked {
        write.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
        write.write_all(data).await?;
        write.write_all(b"\r\n").await?;
    } else {
        write.write_all(data).await?;
    }
    Ok(())
}

/// Forwards `body_chunk`/`body_end` frames the client already sent for
/// this request (an opening envelope with `body: None` means the
/// ProxyFrontend is streaming the body separately) onto the origin
/// socket, re-chunking if the origin needs `Transfer-Encoding: chunked`
/// framing.
async fn stream_request_body_to_origin(write: &mut WriteHalf<TcpStream>, request: &mut InflightRequest, chunked: bool) -> std::io::Result<()> {
    loop {
        match request.inbound_rx.recv().await {
            Some(Envelope::BodyChunk { data, .. }) => write_body_chunk(write, &data, chunked).await?,
            Some(Envelope::BodyEnd { .. }) | None => break,
            _ => continue,
        }
    }
    Ok(())
}

async fn read_response_head(reader: &mut BufReader<ReadHalf<TcpStream>>) -> anyhow::Result<ResponseHead> {
    let mut buf = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            anyhow::bail!("origin closed before sending a response");
        }
        buf.extend_from_slice(&line);
        if buf.len() > MAX_HEADER_BYTES {
            anyhow::bail!("origin response head too large");
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp.parse(&buf)?;
    if status.is_partial() {
        anyhow::bail!("incomplete origin response head");
    }
    let code = resp.code.ok_or_else(|| anyhow::anyhow!("missing status code"))?;

    let mut headers = Vec::new();
    for h in resp.headers.iter() {
        headers.push((h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()));
    }
    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());
    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));

    Ok(ResponseHead { status: code, headers, content_length, chunked })
}

async fn stream_origin_body_to_tunnel(
    reader: &mut BufReader<ReadHalf<TcpStream>>,
    head: &ResponseHead,
    request: &InflightRequest,
) -> Result<(), ErrorCode> {
    if head.chunked {
        loop {
            let mut size_line = Vec::new();
            reader.read_until(b'\n', &mut size_line).await.map_err(|_| ErrorCode::OriginError)?;
            let size_str = String::from_utf8_lossy(&size_line);
            let size = u64::from_str_radix(size_str.trim().split(';').next().unwrap_or("0"), 16).map_err(|_| ErrorCode::OriginError)?;
            if size == 0 {
                let mut trailer = Vec::new();
                reader.read_until(b'\n', &mut trailer).await.map_err(|_| ErrorCode::OriginError)?;
                break;
            }
            let mut chunk = vec![0u8; size as usize];
            reader.read_exact(&mut chunk).await.map_err(|_| ErrorCode::OriginError)?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await.map_err(|_| ErrorCode::OriginError)?;
            request
                .send(Envelope::BodyChunk { request_id: request.request_id, data: chunk })
                .await
                .map_err(|_| ErrorCode::TunnelLost)?;
        }
    } else if let Some(len) = head.content_length {
        let mut remaining = len;
        while remaining > 0 {
            let chunk_len = remaining.min(ORIGIN_CHUNK as u64) as usize;
            let mut buf = vec![0u8; chunk_len];
            reader.read_exact(&mut buf).await.map_err(|_| ErrorCode::OriginError)?;
            remaining -= chunk_len as u64;
            request.send(Envelope::BodyChunk { request_id: request.request_id, data: buf }).await.map_err(|_| ErrorCode::TunnelLost)?;
        }
    } else {
        let mut buf = vec![0u8; ORIGIN_CHUNK];
        loop {
            let n = reader.read(&mut buf).await.map_err(|_| ErrorCode::OriginError)?;
            if n == 0 {
                break;
            }
            request
                .send(Envelope::BodyChunk { request_id: request.request_id, data: buf[..n].to_vec() })
                .await
                .map_err(|_| ErrorCode::TunnelLost)?;
        }
    }
    Ok(())
}

/// Bidirectional opaque byte pump for an established CONNECT tunnel
/// (spec §4.3: "pipe bytes in both directions until either side
/// closes; then send `body_end` on the remaining direction").
async fn pipe_connect(origin: TcpStream, request: &mut InflightRequest) {
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);
    let request_id = request.request_id;
    let mut origin_buf = [0u8; ORIGIN_CHUNK];
    loop {
        tokio::select! {
            n = origin_read.read(&mut origin_buf) => {
                match n {
                    Ok(0) | Err(_) => {
                        let _ = request.send(Envelope::BodyEnd { request_id }).await;
                        return;
                    }
                    Ok(n) => {
                        if request.send(Envelope::BodyChunk { request_id, data: origin_buf[..n].to_vec() }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            frame = request.inbound_rx.recv() => {
                match frame {
                    Some(Envelope::BodyChunk { data, .. }) => {
                        if origin_write.write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Some(Envelope::BodyEnd { .. }) | None => return,
                    Some(Envelope::Error { .. }) => return,
                    _ => continue,
                }
            }
        }
    }
}
