//! # Server configuration
//!
//! Loaded from a TOML file (`--config` / `FLUIDITY_CONFIG`, default
//! `fluidity-server.toml`), with the handful of fields operators most
//! commonly override per-deploy also settable via `FLUIDITY_*`
//! environment variables. Covers every server-side option spec.md §6
//! enumerates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tunnel_protocol::breaker::BreakerConfig;
use tunnel_protocol::config::{DialTimeouts, OriginTimeouts, SessionConfig};
use tunnel_protocol::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct MtlsIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    /// Expected agent certificate CN/SAN; mismatch aborts the handshake.
    pub expected_client_identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthParams {
    /// Credential method this responder accepts (spec §4.2). The
    /// default validator ([`crate::auth::ExpectedMethodValidator`])
    /// rejects anything else outright.
    pub expected_method: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSeconds {
    #[serde(default = "d_tls_handshake")]
    pub tls_handshake: u64,
    #[serde(default = "d_auth_exchange")]
    pub auth_exchange: u64,
    #[serde(default = "d_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "d_no_traffic_deadline")]
    pub no_traffic_deadline: u64,
    #[serde(default = "d_origin_dial")]
    pub origin_dial: u64,
    #[serde(default = "d_origin_request")]
    pub origin_request: u64,
}

fn d_tls_handshake() -> u64 {
    10
}
fn d_auth_exchange() -> u64 {
    30
}
fn d_ping_interval() -> u64 {
    15
}
fn d_no_traffic_deadline() -> u64 {
    45
}
fn d_origin_dial() -> u64 {
    10
}
fn d_origin_request() -> u64 {
    60
}

impl Default for TimeoutsSeconds {
    fn default() -> Self {
        Self {
            tls_handshake: d_tls_handshake(),
            auth_exchange: d_auth_exchange(),
            ping_interval: d_ping_interval(),
            no_traffic_deadline: d_no_traffic_deadline(),
            origin_dial: d_origin_dial(),
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

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake)
    }

    pub fn origin_dial_timeouts(&self) -> DialTimeouts {
        DialTimeouts { dial: Duration::from_secs(self.origin_dial), tls_handshake: Duration::from_secs(self.tls_handshake) }
    }

    pub fn origin_timeouts(&self) -> OriginTimeouts {
        OriginTimeouts { origin_request: Duration::from_secs(self.origin_request) }
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

fn d_retry_base_ms() -> u64 {
    250
}
fn d_retry_max_ms() -> u64 {
    30_000
}
fn d_retry_max_attempts() -> u32 {
    5
}

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

fn d_failure_threshold() -> u32 {
    5
}
fn d_open_duration_secs() -> u64 {
    30
}

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
    8443
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub mtls: MtlsIdentity,
    pub auth: AuthParams,
    #[serde(default)]
    pub timeouts: TimeoutsSeconds,
    #[serde(default)]
    pub retry: RetryParams,
    #[serde(default)]
    pub breaker: BreakerParams,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let mut cfg: ServerConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }
}

/// Only the handful of fields operators commonly override per-deploy
/// are covered; structural config (mTLS paths) stays file-only.
fn apply_env_overrides(cfg: &mut ServerConfig) {
    if let Ok(v) = std::env::var("FLUIDITY_LISTEN_PORT") {
        if let Ok(p) = v.parse() {
            cfg.listen_port = p;
        }
    }
    if let Ok(v) = std::env::var("FLUIDITY_LOG_LEVEL") {
        cfg.log_level = v;
    }
}
