//! # Error taxonomy
//!
//! `ErrorCode` is the enum carried on the wire in an `error` envelope
//! (spec §7). `TunnelError` is the Rust-side error type used inside
//! this crate; it is intentionally richer than `ErrorCode` (it can
//! represent, e.g., framing violations with detail) but every variant
//! maps onto exactly one wire code via [`TunnelError::code`].

use serde::{Deserialize, Serialize};

/// Wire-level error code (spec §7 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DnsFailure,
    ConnectRefused,
    Timeout,
    CircuitOpen,
    OriginError,
    AuthFailed,
    TunnelLost,
    BackpressureExceeded,
    ProtocolError,
}

impl ErrorCode {
    /// Per-request errors are recovered locally: the offending
    /// InflightRequest dies, everything else on the session continues.
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed | ErrorCode::TunnelLost | ErrorCode::ProtocolError
        )
    }

    /// The status a browser-facing proxy response maps this code to
    /// (spec §6, §7).
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Timeout => 504,
            ErrorCode::CircuitOpen => 503,
            ErrorCode::DnsFailure
            | ErrorCode::ConnectRefused
            | ErrorCode::OriginError
            | ErrorCode::TunnelLost
            | ErrorCode::AuthFailed
            | ErrorCode::BackpressureExceeded
            | ErrorCode::ProtocolError => 502,
        }
    }
}

/// Errors internal to the tunnel transport. Every variant has a
/// well-defined [`ErrorCode`] so it can cross the wire.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("frame exceeds max size ({size} > {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("malformed payload for tag {tag}: {source}")]
    Decode {
        tag: u8,
        #[source]
        source: bincode::Error,
    },

    #[error("unknown envelope tag {0}")]
    UnknownTag(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("auth exchange failed: {0}")]
    AuthFailed(String),

    #[error("heartbeat timeout: no frame received within deadline")]
    HeartbeatTimeout,

    #[error("tunnel session lost: {0}")]
    TunnelLost(String),

    #[error("protocol invariant violated: {0}")]
    ProtocolViolation(String),

    #[error("consumer backpressure exceeded for request")]
    BackpressureExceeded,
}

impl TunnelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::FrameTooLarge { .. }
            | TunnelError::Truncated { .. }
            | TunnelError::Decode { .. }
            | TunnelError::UnknownTag(_)
            | TunnelError::ProtocolViolation(_) => ErrorCode::ProtocolError,
            TunnelError::Io(_) | TunnelError::TunnelLost(_) => ErrorCode::TunnelLost,
            TunnelError::AuthFailed(_) => ErrorCode::AuthFailed,
            TunnelError::HeartbeatTimeout => ErrorCode::TunnelLost,
            TunnelError::BackpressureExceeded => ErrorCode::BackpressureExceeded,
        }
    }
}
