//! Shared fixtures for the end-to-end scenario tests (spec §8 S1-S6).
//!
//! No checked-in fixture files: a fresh CA and a leaf cert per identity
//! are generated for every test run via `rcgen`, written to a temp
//! directory that lives as long as the returned [`CertMaterials`].

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub struct TestCa {
    key: KeyPair,
    params: CertificateParams,
    pub cert_pem: String,
}

pub struct LeafCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "fluidity-test-root");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).expect("self-sign test CA");
        let cert_pem = cert.pem();
        Self { key, params, cert_pem }
    }

    /// Issues a leaf certificate whose CN and DNS SAN are both
    /// `identity`, matching the CN-or-SAN pinning both sides of the
    /// tunnel do (server's `IdentityPinnedVerifier`, agent's
    /// `ServerName`-based hostname check).
    pub fn issue_leaf(&self, identity: &str) -> LeafCert {
        let key = KeyPair::generate().expect("generate leaf key");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(identity.to_string().try_into().expect("valid dns name"))];
        let issuer = Issuer::from_params(&self.params, &self.key);
        let cert = params.signed_by(&key, &issuer).expect("sign leaf cert");
        LeafCert { cert_pem: cert.pem(), key_pem: key.serialize_pem() }
    }
}

/// A CA plus one leaf identity for each side of the tunnel, already
/// written out as PEM files so `MtlsIdentity`/`config::MtlsIdentity`
/// configs can point straight at them.
pub struct CertMaterials {
    _dir: tempfile::TempDir,
    pub ca_path: PathBuf,
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
    pub agent_cert_path: PathBuf,
    pub agent_key_path: PathBuf,
    pub credential_path: PathBuf,
}

pub const SERVER_IDENTITY: &str = "fluidity-server-test";
pub const AGENT_IDENTITY: &str = "fluidity-agent-test";

pub fn generate_materials() -> CertMaterials {
    let ca = TestCa::new();
    let server_leaf = ca.issue_leaf(SERVER_IDENTITY);
    let agent_leaf = ca.issue_leaf(AGENT_IDENTITY);

    let dir = tempfile::tempdir().expect("create temp dir for test certs");
    let write = |name: &str, contents: &str| -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("write test fixture");
        path
    };

    let ca_path = write("ca.pem", &ca.cert_pem);
    let server_cert_path = write("server-cert.pem", &server_leaf.cert_pem);
    let server_key_path = write("server-key.pem", &server_leaf.key_pem);
    let agent_cert_path = write("agent-cert.pem", &agent_leaf.cert_pem);
    let agent_key_path = write("agent-key.pem", &agent_leaf.key_pem);
    let credential_path = write("credential.txt", "test-bearer-credential");

    CertMaterials { _dir: dir, ca_path, server_cert_path, server_key_path, agent_cert_path, agent_key_path, credential_path }
}

/// A bare-bones origin server used as the thing the server's
/// OriginExecutor actually dials: it parses one HTTP/1.1 request per
/// connection with `httparse` and writes back a fixed status/body.
pub async fn spawn_canned_http_origin(status_line: &'static str, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                if read_request_head(&mut reader).await.is_err() {
                    return;
                }
                let resp = format!("{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}", body.len());
                let _ = reader.get_mut().write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

/// Like [`spawn_canned_http_origin`] but echoes the request's path back
/// in the body, so concurrent callers can tell their own response apart
/// from another in-flight request's (spec §8 S3).
pub async fn spawn_echo_path_http_origin() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                let Ok(path) = read_request_head(&mut reader).await else { return };
                let body = path;
                let resp = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}", body.len());
                let _ = reader.get_mut().write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

/// Like [`spawn_canned_http_origin`] but replies with
/// `Transfer-Encoding: chunked` and a chunked body instead of
/// `Content-Length`, so the exercise a dynamic origin whose response the
/// OriginExecutor must de-chunk rather than forward length-framed.
pub async fn spawn_chunked_http_origin(chunks: &'static [&'static str]) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind origin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                if read_request_head(&mut reader).await.is_err() {
                    return;
                }
                let mut resp = String::from("HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
                for chunk in chunks {
                    resp.push_str(&format!("{:x}\r\n{chunk}\r\n", chunk.len()));
                }
                resp.push_str("0\r\n\r\n");
                let _ = reader.get_mut().write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

async fn read_request_head(reader: &mut BufReader<TcpStream>) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            anyhow::bail!("eof before full request head");
        }
        buf.extend_from_slice(&line);
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf)?;
    Ok(req.path.unwrap_or("/").to_string())
}

/// A raw TCP origin that echoes back exactly what it reads, standing in
/// for "the opaque bytes of a TLS connection to the real origin" that a
/// CONNECT tunnel is meant to pipe untouched (spec §8 S2).
pub async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind echo origin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// The three URLs a mock control-plane HTTP server is reachable at.
pub struct ControlPlaneUrls {
    pub wake_url: String,
    pub query_url: String,
    pub kill_url: String,
}

/// A minimal stand-in for the external orchestrator behind Wake/Query/Kill
/// (spec §6, §8 S5): `Wake` always answers `starting`; the first `Query`
/// answers `pending`, every one after that answers `ready` with
/// `ready_public_ip`, exercising the poll-interval-doubling path once
/// before the agent reaches `Dialing`.
pub async fn spawn_mock_control_plane(ready_public_ip: String) -> ControlPlaneUrls {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind control-plane listener");
    let addr = listener.local_addr().unwrap();
    let query_count = Arc::new(AtomicU32::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            let query_count = query_count.clone();
            let ready_public_ip = ready_public_ip.clone();
            tokio::spawn(async move {
                let _ = handle_control_plane_request(socket, &query_count, &ready_public_ip).await;
            });
        }
    });

    let base = format!("http://{addr}");
    ControlPlaneUrls { wake_url: format!("{base}/wake"), query_url: format!("{base}/query"), kill_url: format!("{base}/kill") }
}

async fn handle_control_plane_request(
    mut socket: TcpStream,
    query_count: &Arc<AtomicU32>,
    ready_public_ip: &str,
) -> anyhow::Result<()> {
    let (path, content_length) = {
        let mut reader = BufReader::new(&mut socket);
        read_request_head_with_length(&mut reader).await?
    };
    let mut body = vec![0u8; content_length];
    socket.read_exact(&mut body).await?;

    let json_body = match path.as_str() {
        "/wake" => serde_json::json!({"status": "starting", "instance_id": "inst-test-1"}).to_string(),
        "/query" => {
            if query_count.fetch_add(1, Ordering::SeqCst) == 0 {
                serde_json::json!({"status": "pending"}).to_string()
            } else {
                serde_json::json!({"status": "ready", "public_ip": ready_public_ip}).to_string()
            }
        }
        _ => serde_json::json!({"status": "killed"}).to_string(),
    };

    let resp = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{json_body}",
        json_body.len()
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

async fn read_request_head_with_length(reader: &mut BufReader<&mut TcpStream>) -> anyhow::Result<(String, usize)> {
    let mut buf = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            anyhow::bail!("eof before full request head");
        }
        buf.extend_from_slice(&line);
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf)?;
    let path = req.path.unwrap_or("/").to_string();
    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    Ok((path, content_length))
}

/// A port nobody is listening on, for provoking `connection_refused`
/// (spec §8 S4): bind then immediately drop so the OS frees the port
/// without anything left to accept on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind throwaway listener");
    listener.local_addr().unwrap().port()
}

/// A byte-forwarding TCP relay sitting between the agent and the real
/// server, so a test can sever the transport mid-session (spec §8 S6
/// "killing the server mid-request") without tearing down the actual
/// server process — only the in-flight TCP connections die, exactly
/// what an agent observes when its peer crashes.
pub struct KillableRelay {
    aborts: Arc<std::sync::Mutex<Vec<tokio::task::AbortHandle>>>,
}

impl KillableRelay {
    /// Severs every connection currently being forwarded. The relay
    /// keeps accepting new ones afterward, so a subsequent dial to the
    /// same address succeeds again (spec §8 S6: "next client request
    /// triggers reconnect and succeeds").
    pub fn kill(&self) {
        for handle in self.aborts.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

pub async fn spawn_killable_relay(target: SocketAddr) -> (u16, KillableRelay) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind relay listener");
    let port = listener.local_addr().unwrap().port();
    let aborts: Arc<std::sync::Mutex<Vec<tokio::task::AbortHandle>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let aborts_for_loop = aborts.clone();

    tokio::spawn(async move {
        loop {
            let Ok((inbound, _)) = listener.accept().await else { return };
            let Ok(outbound) = TcpStream::connect(target).await else { continue };
            let handle = tokio::spawn(async move {
                let (mut ir, mut iw) = inbound.into_split();
                let (mut or, mut ow) = outbound.into_split();
                let a = tokio::io::copy(&mut ir, &mut ow);
                let b = tokio::io::copy(&mut or, &mut iw);
                let _ = tokio::join!(a, b);
            });
            aborts_for_loop.lock().unwrap().push(handle.abort_handle());
        }
    });

    (port, KillableRelay { aborts })
}

/// An origin that streams `total_bytes` back in small chunks with a
/// delay between each, so a test can sever the connection partway
/// through a large response (spec §8 S6).
pub async fn spawn_slow_http_origin(total_bytes: usize, chunk_bytes: usize, delay: std::time::Duration) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind slow origin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut reader = BufReader::new(socket);
                if read_request_head(&mut reader).await.is_err() {
                    return;
                }
                let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {total_bytes}\r\nconnection: close\r\n\r\n");
                if reader.get_mut().write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let chunk = vec![b'x'; chunk_bytes];
                let mut sent = 0usize;
                while sent < total_bytes {
                    let n = chunk_bytes.min(total_bytes - sent);
                    if reader.get_mut().write_all(&chunk[..n]).await.is_err() {
                        return;
                    }
                    sent += n;
                    tokio::time::sleep(delay).await;
                }
            });
        }
    });
    addr
}
