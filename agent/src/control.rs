//! # Control-plane client
//!
//! The three external HTTPS operations (spec §6): Wake, Query, Kill.
//! These are "external collaborators" — the spec fixes only the wire
//! shapes, not how the orchestrator behind them actually scales the
//! server. This client just does the HTTP call and maps the response
//! (or its absence) onto [`TunnelError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tunnel_protocol::error::TunnelError;

use crate::config::ControlPlaneEndpoints;

#[derive(Debug, Clone, Serialize)]
struct WakeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WakeResponse {
    pub status: WakeStatus,
    /// Required by the core (spec §8 open question): a response lacking
    /// this is rejected with `protocol_error` rather than accepted as
    /// the older, pre-`instance_id` shape. `#[serde(default)]` so an
    /// absent key deserializes to `None` and reaches that check,
    /// instead of failing deserialization itself with a less precise
    /// error.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub desired_count: Option<u32>,
    #[serde(default)]
    pub running_count: Option<u32>,
    #[serde(default)]
    pub pending_count: Option<u32>,
    #[serde(default)]
    pub estimated_start_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeStatus {
    AlreadyRunning,
    Starting,
    Waking,
    Scaling,
}

#[derive(Debug, Clone, Serialize)]
struct QueryRequest {
    instance_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub status: QueryStatus,
    /// Only present on `ready` (spec §6); `#[serde(default)]` so
    /// `pending`/`negative` responses that correctly omit it still
    /// deserialize.
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub server_arn: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Negative,
    Pending,
    Ready,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    endpoints: ControlPlaneEndpoints,
}

impl ControlPlaneClient {
    pub fn new(endpoints: ControlPlaneEndpoints) -> Self {
        Self { http: reqwest::Client::new(), endpoints }
    }

    /// Idempotent: the spec explicitly allows repeated Wake calls
    /// (retried by the resiliency kit, re-invoked whenever the
    /// LifecycleController falls back to `Idle`).
    pub async fn wake(
        &self,
        cluster: Option<String>,
        service: Option<String>,
        timeout: Duration,
    ) -> Result<WakeResponse, TunnelError> {
        let resp = self
            .http
            .post(&self.endpoints.wake_url)
            .bearer_auth(&self.endpoints.bearer_token)
            .json(&WakeRequest { cluster, service })
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TunnelError::TunnelLost(format!("wake call failed: {e}")))?;
        let body: WakeResponse = resp
            .error_for_status()
            .map_err(|e| TunnelError::TunnelLost(format!("wake call rejected: {e}")))?
            .json()
            .await
            .map_err(|e| TunnelError::ProtocolViolation(format!("malformed wake response: {e}")))?;
        if body.instance_id.is_none() {
            return Err(TunnelError::ProtocolViolation(
                "wake response missing instance_id".into(),
            ));
        }
        Ok(body)
    }

    pub async fn query(&self, instance_id: &str, timeout: Duration) -> Result<QueryResponse, TunnelError> {
        let resp = self
            .http
            .post(&self.endpoints.query_url)
            .bearer_auth(&self.endpoints.bearer_token)
            .json(&QueryRequest { instance_id: instance_id.to_string() })
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TunnelError::TunnelLost(format!("query call failed: {e}")))?;
        resp.error_for_status()
            .map_err(|e| TunnelError::TunnelLost(format!("query call rejected: {e}")))?
            .json()
            .await
            .map_err(|e| TunnelError::ProtocolViolation(format!("malformed query response: {e}")))
    }

    /// Best-effort, fire-and-forget (spec §4.4): failures are logged by
    /// the caller and never propagated to the state machine.
    pub async fn kill(&self, timeout: Duration) -> Result<KillResponse, TunnelError> {
        let resp = self
            .http
            .post(&self.endpoints.kill_url)
            .bearer_auth(&self.endpoints.bearer_token)
            .json(&serde_json::json!({}))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TunnelError::TunnelLost(format!("kill call failed: {e}")))?;
        resp.error_for_status()
            .map_err(|e| TunnelError::TunnelLost(format!("kill call rejected: {e}")))?
            .json()
            .await
            .map_err(|e| TunnelError::ProtocolViolation(format!("malformed kill response: {e}")))
    }
}
