//! End-to-end scenarios from spec.md §8 (S1-S6), exercising a real
//! agent (`fluidity_agent`) and a real server (`fluidity_server`)
//! talking mTLS over loopback TCP, with canned origins standing in for
//! "the real origin". Sizes are scaled down from the spec's literal
//! values (5 MiB / 100 MiB) to keep the suite fast; the properties
//! under test (byte-identical streaming, concurrent isolation,
//! reconnect-after-kill) don't depend on the literal size.

mod common;

use std::sync::Arc;
use std::time::Duration;

use fluidity_agent::config::{AgentConfig, AuthCredential, ControlPlaneEndpoints, MtlsIdentity as AgentMtlsIdentity};
use fluidity_agent::{lifecycle, proxy};
use fluidity_server::auth::ExpectedMethodValidator;
use fluidity_server::config::{AuthParams, MtlsIdentity as ServerMtlsIdentity, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use common::*;

const AUTH_METHOD: &str = "bearer";

fn agent_config(
    materials: &CertMaterials,
    remote_addr: Option<String>,
    control_plane: ControlPlaneEndpoints,
) -> AgentConfig {
    AgentConfig {
        listen_port: 0, // overridden by binding to an ephemeral port directly
        remote_addr,
        remote_port: 0,
        control_plane,
        mtls: AgentMtlsIdentity {
            cert_path: materials.agent_cert_path.clone(),
            key_path: materials.agent_key_path.clone(),
            ca_path: materials.ca_path.clone(),
            expected_server_identity: SERVER_IDENTITY.to_string(),
        },
        auth: AuthCredential { method: AUTH_METHOD.to_string(), credential_path: materials.credential_path.clone() },
        timeouts: Default::default(),
        retry: Default::default(),
        breaker: Default::default(),
        log_level: "error".to_string(),
        state_file: None,
        max_polls: 10,
    }
}

fn dummy_control_plane() -> ControlPlaneEndpoints {
    // Only reached if discover_address() falls through to Wake/Query,
    // which none of S1-S4/S6 do (they set remote_addr explicitly).
    ControlPlaneEndpoints {
        wake_url: "http://127.0.0.1:1/wake".to_string(),
        query_url: "http://127.0.0.1:1/query".to_string(),
        kill_url: "http://127.0.0.1:1/kill".to_string(),
        bearer_token: "unused".to_string(),
    }
}

fn server_config(materials: &CertMaterials, listen_port: u16) -> ServerConfig {
    ServerConfig {
        listen_port,
        mtls: ServerMtlsIdentity {
            cert_path: materials.server_cert_path.clone(),
            key_path: materials.server_key_path.clone(),
            ca_path: materials.ca_path.clone(),
            expected_client_identity: AGENT_IDENTITY.to_string(),
        },
        auth: AuthParams { expected_method: AUTH_METHOD.to_string() },
        timeouts: Default::default(),
        retry: Default::default(),
        breaker: Default::default(),
        log_level: "error".to_string(),
    }
}

/// Starts a server accept loop on an ephemeral port and returns the
/// port plus a cancellation token the test can use to stop it.
async fn spawn_server(materials: &CertMaterials) -> (u16, CancellationToken) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind server listener");
    let port = listener.local_addr().unwrap().port();
    let cfg = server_config(materials, port);
    let validator = Arc::new(ExpectedMethodValidator::new(AUTH_METHOD.to_string()));
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = fluidity_server::serve(listener, cfg, validator, server_cancel).await;
    });
    (port, cancel)
}

/// Starts an agent's lifecycle controller and proxy frontend, waits
/// for the tunnel to reach `Connected`, and returns the proxy's bound
/// port plus the lifecycle handle (kept alive for the test's duration).
async fn spawn_agent(cfg: AgentConfig) -> (u16, lifecycle::LifecycleHandle) {
    let origin_timeout = cfg.timeouts.origin_request();
    let handle = lifecycle::spawn(cfg).expect("spawn lifecycle controller");
    wait_for_state(&handle, lifecycle::LifecycleState::Connected, Duration::from_secs(30)).await;

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind proxy listener");
    let proxy_port = listener.local_addr().unwrap().port();
    let frontend = proxy::ProxyFrontend::new(handle.sessions.clone(), origin_timeout, handle.cancellation_token());
    tokio::spawn(frontend.serve_on(listener));

    (proxy_port, handle)
}

async fn wait_for_state(handle: &lifecycle::LifecycleHandle, want: lifecycle::LifecycleState, timeout: Duration) {
    let mut states = handle.states.clone();
    tokio::time::timeout(timeout, async {
        loop {
            if *states.borrow() == want {
                return;
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for lifecycle state {want:?}"));
}

/// Sends one absolute-form GET through the proxy and returns (status, body).
async fn proxy_get(proxy_port: u16, target: &str) -> (u16, String) {
    let mut sock = TcpStream::connect(("127.0.0.1", proxy_port)).await.expect("connect to proxy");
    let req = format!("GET {target} HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n");
    sock.write_all(req.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    sock.read_to_end(&mut raw).await.unwrap();
    split_status_and_body(&raw)
}

fn split_status_and_body(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.splitn(2, "\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
    (status, body)
}

// S1 — HTTP GET: origin replies 200 with body "hello".
#[tokio::test]
async fn s1_http_get_round_trips_status_and_body() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{server_port}")), dummy_control_plane());
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let origin_addr = spawn_canned_http_origin("HTTP/1.1 200 OK", "hello").await;
    let (status, body) = proxy_get(proxy_port, &format!("http://{origin_addr}/")).await;

    assert_eq!(status, 200);
    assert_eq!(body, "hello");
}

// Chunked origin response: the OriginExecutor de-chunks the origin's
// body into `body_chunk`/`body_end` envelopes, so the header it hands
// back to the client must not still say `transfer-encoding: chunked`
// (the client would then expect chunk framing in a body that's already
// been stripped of it) — regression test for that header/body mismatch.
#[tokio::test]
async fn chunked_origin_response_is_dechunked_before_reaching_client() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{server_port}")), dummy_control_plane());
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let origin_addr = spawn_chunked_http_origin(&["hello, ", "chunked ", "world"]).await;

    let mut sock = TcpStream::connect(("127.0.0.1", proxy_port)).await.expect("connect to proxy");
    let req = format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n");
    sock.write_all(req.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    sock.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);

    let mut parts = text.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or_default().to_ascii_lowercase();
    let body = parts.next().unwrap_or_default();

    assert!(!head.contains("transfer-encoding"), "stray transfer-encoding header: {head}");
    assert_eq!(body, "hello, chunked world");
}

// S2 — CONNECT to a TLS-shaped origin: bytes survive the tunnel
// byte-identical in both directions (spec uses an actual TLS origin;
// here the opaque-byte-pump property is what's under test, so a raw
// echo origin is equivalent — the tunnel never looks inside CONNECT
// bytes either way).
#[tokio::test]
async fn s2_connect_tunnels_opaque_bytes_byte_identical() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{server_port}")), dummy_control_plane());
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let origin_addr = spawn_echo_origin().await;

    let mut sock = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    sock.write_all(format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n").as_bytes()).await.unwrap();

    let mut head = [0u8; 64];
    let n = sock.read(&mut head).await.unwrap();
    let head_text = String::from_utf8_lossy(&head[..n]);
    assert!(head_text.starts_with("HTTP/1.1 200"), "expected 200 Connection Established, got: {head_text}");

    // 512 KiB upload/download, scaled down from the spec's 5 MiB.
    // Write and read concurrently: this exceeds typical OS socket
    // buffer sizes, and the echo origin only drains its read side as
    // fast as it can write back, so a strictly write-then-read client
    // would deadlock against a peer doing the same.
    let payload = vec![0x5au8; 512 * 1024];
    let (mut read_half, mut write_half) = sock.into_split();
    let writer_payload = payload.clone();
    let write_task = tokio::spawn(async move {
        write_half.write_all(&writer_payload).await.unwrap();
    });

    let mut received = vec![0u8; payload.len()];
    read_half.read_exact(&mut received).await.unwrap();
    write_task.await.unwrap();
    assert_eq!(received, payload);
}

// S3 — 10 concurrent GETs over one tunnel all succeed; each gets its
// own response (no cross-talk between request ids).
#[tokio::test]
async fn s3_concurrent_requests_are_isolated_by_request_id() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{server_port}")), dummy_control_plane());
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let origin_addr = spawn_echo_path_http_origin().await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let target = format!("http://{origin_addr}/req-{i}");
        tasks.push(tokio::spawn(async move { (i, proxy_get(proxy_port, &target).await) }));
    }

    for task in tasks {
        let (i, (status, body)) = task.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, format!("/req-{i}"));
    }
}

// S4 — origin TCP refused: client sees 502, unrelated concurrent
// requests are unaffected.
#[tokio::test]
async fn s4_origin_refused_yields_502_without_affecting_other_requests() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{server_port}")), dummy_control_plane());
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let dead_port = unused_port().await;
    let good_origin = spawn_canned_http_origin("HTTP/1.1 200 OK", "still fine").await;

    let bad = tokio::spawn(async move { proxy_get(proxy_port, &format!("http://127.0.0.1:{dead_port}/")).await });
    let good = tokio::spawn(async move { proxy_get(proxy_port, &format!("http://{good_origin}/")).await });

    let (bad_status, _) = bad.await.unwrap();
    let (good_status, good_body) = good.await.unwrap();

    assert_eq!(bad_status, 502);
    assert_eq!(good_status, 200);
    assert_eq!(good_body, "still fine");
}

// S5 — cold start: Wake answers `starting`, the first Query answers
// `pending`, the next answers `ready` with an address; the agent
// dials that address and serves a request successfully.
#[tokio::test]
async fn s5_cold_start_wakes_polls_then_serves() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;

    let control_urls = spawn_mock_control_plane(format!("127.0.0.1:{server_port}")).await;
    let control_plane = ControlPlaneEndpoints {
        wake_url: control_urls.wake_url,
        query_url: control_urls.query_url,
        kill_url: control_urls.kill_url,
        bearer_token: "unused".to_string(),
    };
    let mut agent_cfg = agent_config(&materials, None, control_plane);
    agent_cfg.timeouts.poll_interval_initial = 1; // default 5s is needlessly slow for a unit test
    agent_cfg.timeouts.poll_interval_max = 2;

    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    let origin_addr = spawn_canned_http_origin("HTTP/1.1 200 OK", "hello").await;
    let (status, body) = proxy_get(proxy_port, &format!("http://{origin_addr}/")).await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello");
}

// S6 — severing the transport mid-download fails that request with a
// tunnel-lost-shaped error, and a subsequent request succeeds after
// the lifecycle controller reconnects.
#[tokio::test]
async fn s6_killed_transport_reconnects_and_serves_again() {
    let materials = generate_materials();
    let (server_port, _server_cancel) = spawn_server(&materials).await;
    let (relay_port, relay) = spawn_killable_relay(([127, 0, 0, 1], server_port).into()).await;

    let mut agent_cfg = agent_config(&materials, Some(format!("127.0.0.1:{relay_port}")), dummy_control_plane());
    agent_cfg.retry.base_ms = 20;
    agent_cfg.retry.max_ms = 200;
    let (proxy_port, _handle) = spawn_agent(agent_cfg).await;

    // A slow origin so the kill lands mid-download rather than after
    // the response has already fully drained.
    let slow_origin = spawn_slow_http_origin(256 * 1024, 8 * 1024, Duration::from_millis(20)).await;

    let download = tokio::spawn(async move {
        let mut sock = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        let req = format!("GET http://{slow_origin}/ HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n");
        sock.write_all(req.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        let _ = sock.read_to_end(&mut raw).await;
        raw.len()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    relay.kill();
    let received_len = download.await.unwrap();
    // The connection was severed mid-stream: either truncated short of
    // the full body, or the client never got a byte before the reset.
    assert!(received_len < 256 * 1024 + 512, "expected a truncated or empty response, got {received_len} bytes");

    // Give the lifecycle controller time to notice, back off, and
    // redial through the (still-listening) relay.
    let healthy_origin = spawn_canned_http_origin("HTTP/1.1 200 OK", "recovered").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let (status, body) = proxy_get(proxy_port, &format!("http://{healthy_origin}/")).await;
        if status == 200 && body == "recovered" {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("agent did not reconnect and serve successfully within deadline (last status {status})");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
