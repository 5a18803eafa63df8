//! Tunable defaults shared by both ends of the tunnel (spec §5).

use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Upper bound on a single frame's wire size (tag + payload).
    pub max_frame_size: usize,
    /// How often the writer sends an idle-keepalive `ping`.
    pub heartbeat_interval: Duration,
    /// No frame of any kind received within this window => session dead.
    pub heartbeat_timeout: Duration,
    /// Wall-clock deadline on the post-handshake auth exchange.
    pub auth_deadline: Duration,
    /// Capacity of the single bounded outbound (writer) queue. Producers
    /// block when full, providing the backpressure spec §5 calls for.
    pub outbound_queue_capacity: usize,
    /// Capacity of each per-request inbound channel. The reader never
    /// blocks on a full one; it fails that request with
    /// `backpressure_exceeded` instead (spec §5).
    pub inbound_queue_capacity: usize,
    /// Capacity of the responder's channel of newly observed inbound
    /// requests (`http_request`/`connect_request` with no existing
    /// InflightRequest yet).
    pub incoming_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            auth_deadline: Duration::from_secs(30),
            outbound_queue_capacity: 256,
            inbound_queue_capacity: 64,
            incoming_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DialTimeouts {
    pub dial: Duration,
    pub tls_handshake: Duration,
}

impl Default for DialTimeouts {
    fn default() -> Self {
        Self { dial: Duration::from_secs(10), tls_handshake: Duration::from_secs(10) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OriginTimeouts {
    pub origin_request: Duration,
}

impl Default for OriginTimeouts {
    fn default() -> Self {
        Self { origin_request: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlPlaneTimeouts {
    pub wake_attempt: Duration,
    pub query: Duration,
    pub poll_interval_initial: Duration,
    pub poll_interval_max: Duration,
    pub max_poll_duration: Duration,
}

impl Default for ControlPlaneTimeouts {
    fn default() -> Self {
        Self {
            wake_attempt: Duration::from_secs(30),
            query: Duration::from_secs(10),
            poll_interval_initial: Duration::from_secs(5),
            poll_interval_max: Duration::from_secs(30),
            max_poll_duration: Duration::from_secs(180),
        }
    }
}
