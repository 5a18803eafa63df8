//! # Wire codec
//!
//! Frame layout (spec §6): `[len: u32 BE][tag: u8][payload: len-1 bytes]`.
//! `len` counts the tag byte plus the payload. The payload itself is
//! bincode with varint integer encoding, which gives us length-prefixed
//! strings/vecs and compact integers without hand-rolling either.

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{Envelope, HeaderMap, RequestId};
use crate::error::{ErrorCode, TunnelError};

/// Default bound on a single frame's total size (tag + payload).
/// Body streams beyond this chunk across multiple `body_chunk` frames.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

fn bincode_opts() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_varint_encoding()
}

// One tag byte per envelope variant. Stable across versions: never
// renumber, only append.
const TAG_HTTP_REQUEST: u8 = 1;
const TAG_CONNECT_REQUEST: u8 = 2;
const TAG_BODY_CHUNK: u8 = 3;
const TAG_BODY_END: u8 = 4;
const TAG_HTTP_RESPONSE: u8 = 5;
const TAG_TUNNEL_READY: u8 = 6;
const TAG_ERROR: u8 = 7;
const TAG_PING: u8 = 8;
const TAG_PONG: u8 = 9;
const TAG_AUTH_REQUEST: u8 = 10;
const TAG_AUTH_RESPONSE: u8 = 11;

#[derive(Serialize, Deserialize)]
struct HttpRequestPayload {
    request_id: u128,
    method: String,
    url: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct ConnectRequestPayload {
    request_id: u128,
    host: String,
    port: u16,
}

#[derive(Serialize, Deserialize)]
struct BodyChunkPayload {
    request_id: u128,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct BodyEndPayload {
    request_id: u128,
}

#[derive(Serialize, Deserialize)]
struct HttpResponsePayload {
    request_id: u128,
    status: u16,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct TunnelReadyPayload {
    request_id: u128,
}

#[derive(Serialize, Deserialize)]
struct ErrorPayload {
    request_id: u128,
    code: ErrorCode,
    detail: String,
}

#[derive(Serialize, Deserialize)]
struct AuthRequestPayload {
    method: String,
    credential: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct AuthResponsePayload {
    ok: bool,
    detail: String,
}

/// Serializes an envelope to its full wire form, including the 4-byte
/// length prefix. Returns an error only if an individual variant's
/// payload cannot be bincode-encoded (should not happen in practice).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, TunnelError> {
    let opts = bincode_opts();
    let (tag, payload) = match envelope {
        Envelope::HttpRequest { request_id, method, url, headers, body } => (
            TAG_HTTP_REQUEST,
            opts.serialize(&HttpRequestPayload {
                request_id: request_id.0,
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            }),
        ),
        Envelope::ConnectRequest { request_id, host, port } => (
            TAG_CONNECT_REQUEST,
            opts.serialize(&ConnectRequestPayload { request_id: request_id.0, host: host.clone(), port: *port }),
        ),
        Envelope::BodyChunk { request_id, data } => (
            TAG_BODY_CHUNK,
            opts.serialize(&BodyChunkPayload { request_id: request_id.0, data: data.clone() }),
        ),
        Envelope::BodyEnd { request_id } => (
            TAG_BODY_END,
            opts.serialize(&BodyEndPayload { request_id: request_id.0 }),
        ),
        Envelope::HttpResponse { request_id, status, headers, body } => (
            TAG_HTTP_RESPONSE,
            opts.serialize(&HttpResponsePayload {
                request_id: request_id.0,
                status: *status,
                headers: headers.clone(),
                body: body.clone(),
            }),
        ),
        Envelope::TunnelReady { request_id } => (
            TAG_TUNNEL_READY,
            opts.serialize(&TunnelReadyPayload { request_id: request_id.0 }),
        ),
        Envelope::Error { request_id, code, detail } => (
            TAG_ERROR,
            opts.serialize(&ErrorPayload { request_id: request_id.0, code: *code, detail: detail.clone() }),
        ),
        Envelope::Ping => (TAG_PING, opts.serialize(&())),
        Envelope::Pong => (TAG_PONG, opts.serialize(&())),
        Envelope::AuthRequest { method, credential } => (
            TAG_AUTH_REQUEST,
            opts.serialize(&AuthRequestPayload { method: method.clone(), credential: credential.clone() }),
        ),
        Envelope::AuthResponse { ok, detail } => (
            TAG_AUTH_RESPONSE,
            opts.serialize(&AuthResponsePayload { ok: *ok, detail: detail.clone() }),
        ),
    };
    let payload = payload.map_err(|e| TunnelError::Decode { tag, source: e })?;

    let frame_len = 1 + payload.len();
    let mut out = Vec::with_capacity(LEN_PREFIX_SIZE + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_be_bytes());
    out.push(tag);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a single frame body (tag + payload, length prefix already
/// stripped by the caller) back into an [`Envelope`].
pub fn decode(frame: &[u8]) -> Result<Envelope, TunnelError> {
    let opts = bincode_opts();
    let (&tag, payload) = frame.split_first().ok_or(TunnelError::UnknownTag(0))?;
    macro_rules! de {
        ($ty:ty) => {
            opts.deserialize::<$ty>(payload).map_err(|e| TunnelError::Decode { tag, source: e })?
        };
    }
    Ok(match tag {
        TAG_HTTP_REQUEST => {
            let p: HttpRequestPayload = de!(HttpRequestPayload);
            Envelope::HttpRequest {
                request_id: RequestId(p.request_id),
                method: p.method,
                url: p.url,
                headers: p.headers,
                body: p.body,
            }
        }
        TAG_CONNECT_REQUEST => {
            let p: ConnectRequestPayload = de!(ConnectRequestPayload);
            Envelope::ConnectRequest { request_id: RequestId(p.request_id), host: p.host, port: p.port }
        }
        TAG_BODY_CHUNK => {
            let p: BodyChunkPayload = de!(BodyChunkPayload);
            Envelope::BodyChunk { request_id: RequestId(p.request_id), data: p.data }
        }
        TAG_BODY_END => {
            let p: BodyEndPayload = de!(BodyEndPayload);
            Envelope::BodyEnd { request_id: RequestId(p.request_id) }
        }
        TAG_HTTP_RESPONSE => {
            let p: HttpResponsePayload = de!(HttpResponsePayload);
            Envelope::HttpResponse {
                request_id: RequestId(p.request_id),
                status: p.status,
                headers: p.headers,
                body: p.body,
            }
        }
        TAG_TUNNEL_READY => {
            let p: TunnelReadyPayload = de!(TunnelReadyPayload);
            Envelope::TunnelReady { request_id: RequestId(p.request_id) }
        }
        TAG_ERROR => {
            let p: ErrorPayload = de!(ErrorPayload);
            Envelope::Error { request_id: RequestId(p.request_id), code: p.code, detail: p.detail }
        }
        TAG_PING => Envelope::Ping,
        TAG_PONG => Envelope::Pong,
        TAG_AUTH_REQUEST => {
            let p: AuthRequestPayload = de!(AuthRequestPayload);
            Envelope::AuthRequest { method: p.method, credential: p.credential }
        }
        TAG_AUTH_RESPONSE => {
            let p: AuthResponsePayload = de!(AuthResponsePayload);
            Envelope::AuthResponse { ok: p.ok, detail: p.detail }
        }
        other => return Err(TunnelError::UnknownTag(other)),
    })
}

/// Reads exactly one frame from `stream`, enforcing `max_frame_size`
/// on the length prefix before allocating a buffer for it.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_frame_size: usize,
) -> Result<Envelope, TunnelError> {
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    stream.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len == 0 || frame_len > max_frame_size {
        return Err(TunnelError::FrameTooLarge { size: frame_len, max: max_frame_size });
    }
    let mut buf = vec![0u8; frame_len];
    stream.read_exact(&mut buf).await?;
    decode(&buf)
}

/// Serializes and writes one envelope to `stream`. Does not flush;
/// callers batching multiple envelopes should flush once at the end.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    envelope: &Envelope,
    max_frame_size: usize,
) -> Result<(), TunnelError> {
    let bytes = encode(envelope)?;
    if bytes.len() - LEN_PREFIX_SIZE > max_frame_size {
        return Err(TunnelError::FrameTooLarge { size: bytes.len() - LEN_PREFIX_SIZE, max: max_frame_size });
    }
    stream.write_all(&bytes).await?;
    Ok(())
}
