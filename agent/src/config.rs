//! # Agent configuration
//!
//! Loaded from a TOML file (`--config` / `FLUIDITY_CONFIG`, default
//! `fluidity-agent.toml`), with every field overridable by an
//! environment variable `FLUIDITY_<FIELD>` (see [`apply_env_overrides`]).
//! Covers every option spec.md §6 enumerates for the agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tunnel_protocol::breaker::BreakerConfig;
use tunnel_protocol::config::{ControlPlaneTimeouts, DialTimeouts, SessionConfig};
use tunnel_protocol::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneEndpoints {
    pub wake_url: String,
    pub query_url: String,
    pub kill_url: String,
    /// Bearer-style credential attached to every control-plane call as
    /// an `Authorization` header (spec §6: "request/response over
    /// HTTPS with a bearer-style credential").
    pub bearer_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MtlsIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    /// Expected server certificate CN/SAN; mismatch aborts the handshake.
    pub expected_server_identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthCredential {
    pub method: String,
    /// Path to a file holding the opaque credential blob, base64 or raw.
    pub credential_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSeconds {
    #[serde(default = "d_dial")]
    pub dial: u64,
    #[serde(default = "d_tls_handshake")]
    pub tls_handshake: u64,
    #[serde(default = "d_auth_exchange")]
    pub auth_exchange: u64,
    #[serde(default = "d_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "d_no_traffic_deadline")]
    pub no_traffic_deadline: u64,
    #[serde(default = "d_wake_attempt")]
    pub wake_attempt: u64,
    #[serde(default = "d_query")]
    pub query: u64,
    #[serde(default = "d_poll_interval_initial")]
    pub poll_interval_initial: u64,
    #[serde(default = "d_poll_interval_max")]
    pub poll_interval_max: u64,
    #[serde(default = "d_max_poll_duration")]
    pub max_poll_duration: u64,
    #[serde(default = "d_origin_request")]
    pub origin_request: u64,
}

fn d_dial() -> u64 { 10 }
fn d_tls_handshake() -> u64 { 10 }
fn d_auth_exchange() -> u64 { 30 }
fn d_ping_interval() -> u64 { 15 }
fn d_no_traffic_deadline() -> u64 { 45 }
fn d_wake_attempt() -> u64 { 30 }
fn d_query() -> u64 { 10 }
fn d_poll_interval_initial() -> u64 { 5 }
fn d_poll_interval_max() -> u64 { 30 }
fn d_max_poll_duration() -> u64 { 180 }
fn d_origin_request() -> u64 { 60 }

impl Default for TimeoutsSeconds {
    fn default() -> Self {
        Self {
            dial: d_dial(),
            tls_handshake: d_tls_handshake(),
            auth_exchange: d_auth_exchange(),
            ping_interval: d_ping_interval(),
            no_traffic_deadline: d_no_traffic_deadline(),
            wake_attempt: d_wake_attempt(),
            query: d_query(),
            poll_interval_initial: d_poll_interval_initial(),
            poll_interval_max: d_poll_interval_max(),
            max_poll_duration: d_max_poll_duration(),
            origin_request: d_origin_request(),
        }
    }
}

impl TimeoutsSeconds {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.ping_interval),
            heartbeat_timeout: Duration::from_secs(self.no_traffic_deadline),
            auth_deadline: Duration::from_secs(self.auth_exchange),
            ..SessionConfig::default()
        }
    }

    pub fn dial_timeouts(&self) -> DialTimeouts {
        DialTimeouts { dial: Duration::from_secs(self.dial), tls_handshake: Duration::from_secs(self.tls_handshake) }
    }

    pub fn origin_request(&self) -> Duration {
        Duration::from_secs(self.origin_request)
    }

    pub fn control_plane_timeouts(&self) -> ControlPlaneTimeouts {
        ControlPlaneTimeouts {
            wake_attempt: Duration::from_secs(self.wake_attempt),
            query: Duration::from_secs(self.query),
            poll_interval_initial: Duration::from_secs(self.poll_interval_initial),
            poll_interval_max: Duration::from_secs(self.poll_interval_max),
            max_poll_duration: Duration::from_secs(self.max_poll_duration),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryParams {
    #[serde(default = "d_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "d_retry_max_ms")]
    pub max_ms: u64,
    #[serde(default = "d_retry_max_attempts")]
    pub max_attempts: u32,
}

fn d_retry_base_ms() -> u64 { 250 }
fn d_retry_max_ms() -> u64 { 30_000 }
fn d_retry_max_attempts() -> u32 { 5 }

impl Default for RetryParams {
    fn default() -> Self {
        Self { base_ms: d_retry_base_ms(), max_ms: d_retry_max_ms(), max_attempts: d_retry_max_attempts() }
    }
}

impl RetryParams {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            jitter: (0.5, 1.5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerParams {
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "d_open_duration_secs")]
    pub open_duration_secs: u64,
}

fn d_failure_threshold() -> u32 { 5 }
fn d_open_duration_secs() -> u64 { 30 }

impl Default for BreakerParams {
    fn default() -> Self {
        Self { failure_threshold: d_failure_threshold(), open_duration_secs: d_open_duration_secs() }
    }
}

impl BreakerParams {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig { failure_threshold: self.failure_threshold, open_duration: Duration::from_secs(self.open_duration_secs) }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_max_polls() -> u32 {
    36
}

fn default_remote_port() -> u16 {
    8443
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Remote server address (host or `host:port`); if absent, the host
    /// is discovered via Wake/Query and combined with `remote_port`.
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Port the server's mTLS listener accepts on, used whenever an
    /// address is discovered rather than given as a full `host:port`.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    pub control_plane: ControlPlaneEndpoints,
    pub mtls: MtlsIdentity,
    pub auth: AuthCredential,
    #[serde(default)]
    pub timeouts: TimeoutsSeconds,
    #[serde(default)]
    pub retry: RetryParams,
    #[serde(default)]
    pub breaker: BreakerParams,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where to persist the last known server address (spec §6).
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Upper bound on Query polls before giving up and re-entering Waking.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let mut cfg: AgentConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }
}

/// Applies simple scalar environment overrides. Only the handful of
/// fields operators commonly need to override per-deploy are covered;
/// structural config (mTLS paths, control-plane URLs) stays file-only.
fn apply_env_overrides(cfg: &mut AgentConfig) {
    if let Ok(v) = std::env::var("FLUIDITY_LISTEN_PORT") {
        if let Ok(p) = v.parse() {
            cfg.listen_port = p;
        }
    }
    if let Ok(v) = std::env::var("FLUIDITY_REMOTE_ADDR") {
        cfg.remote_addr = Some(v);
    }
    if let Ok(v) = std::env::var("FLUIDITY_LOG_LEVEL") {
        cfg.log_level = v;
    }
}
