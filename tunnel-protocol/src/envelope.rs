//! # Envelope
//!
//! The unit exchanged on the mTLS stream (spec §3). Every variant here
//! mirrors a wire type tag assigned in [`tag`]; the codec (see
//! [`crate::codec`]) is responsible for turning a tag + bincode payload
//! into one of these and back.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorCode;

/// Opaque 128-bit identifier, agent-assigned, unique per live tunnel.
/// The namespace resets on every new [`crate::session::TunnelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u128);

impl RequestId {
    /// Generates a fresh, agent-side request id. The agent is the only
    /// side that mints ids (spec §3): the server only ever echoes one
    /// back that it first saw on an `http_request`/`connect_request`.
    pub fn new() -> Self {
        // Two u64 draws avoid pulling in a uuid dependency just for this.
        let hi = rand::random::<u64>() as u128;
        let lo = rand::random::<u64>() as u128;
        RequestId((hi << 64) | lo)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Case-insensitive, order-preserving multimap of HTTP header values.
///
/// Keys are normalized to lowercase on insert (case-insensitivity);
/// the ordered list of values per key, and the insertion order of keys
/// themselves, is preserved so re-serialized headers look like what a
/// client sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: String) {
        let key = name.to_ascii_lowercase();
        if let Some((_, values)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            values.push(value);
        } else {
            self.entries.push((key, vec![value]));
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

/// Credential method tag for the post-handshake auth exchange (spec §4.2).
/// The blob itself is opaque to the core.
pub type AuthMethod = String;

/// All wire messages exchanged over a single framed mTLS stream.
///
/// The reader/writer in [`crate::session`] never see anything else;
/// `Envelope` is the whole vocabulary of the tunnel transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    HttpRequest {
        request_id: RequestId,
        method: String,
        url: String,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    },
    ConnectRequest {
        request_id: RequestId,
        host: String,
        port: u16,
    },
    BodyChunk {
        request_id: RequestId,
        data: Vec<u8>,
    },
    BodyEnd {
        request_id: RequestId,
    },
    HttpResponse {
        request_id: RequestId,
        status: u16,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    },
    TunnelReady {
        request_id: RequestId,
    },
    Error {
        request_id: RequestId,
        code: ErrorCode,
        detail: String,
    },
    Ping,
    Pong,
    AuthRequest {
        method: AuthMethod,
        credential: Vec<u8>,
    },
    AuthResponse {
        ok: bool,
        detail: String,
    },
}

impl Envelope {
    /// The request id this envelope belongs to, if any. `Ping`/`Pong`
    /// and the auth pair are session-level and carry none.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Envelope::HttpRequest { request_id, .. }
            | Envelope::ConnectRequest { request_id, .. }
            | Envelope::BodyChunk { request_id, .. }
            | Envelope::BodyEnd { request_id }
            | Envelope::HttpResponse { request_id, .. }
            | Envelope::TunnelReady { request_id }
            | Envelope::Error { request_id, .. } => Some(*request_id),
            Envelope::Ping
            | Envelope::Pong
            | Envelope::AuthRequest { .. }
            | Envelope::AuthResponse { .. } => None,
        }
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::HttpRequest { .. } => "http_request",
            Envelope::ConnectRequest { .. } => "connect_request",
            Envelope::BodyChunk { .. } => "body_chunk",
            Envelope::BodyEnd { .. } => "body_end",
            Envelope::HttpResponse { .. } => "http_response",
            Envelope::TunnelReady { .. } => "tunnel_ready",
            Envelope::Error { .. } => "error",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::AuthRequest { .. } => "auth_request",
            Envelope::AuthResponse { .. } => "auth_response",
        }
    }

    /// True for the two envelope types permitted before
    /// `auth_response{ok}` has been observed (spec §4.2).
    pub fn is_auth(&self) -> bool {
        matches!(self, Envelope::AuthRequest { .. } | Envelope::AuthResponse { .. })
    }
}
