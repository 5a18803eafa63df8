//! # mTLS client identity
//!
//! Builds the `rustls::ClientConfig` the agent presents when dialing
//! the server: its own certificate/key (so the server can authenticate
//! it) and the CA that must have signed the server's certificate.
//! Modeled on the sidecar's `build_client_config` pattern (same
//! cert/key/CA loading, same `TlsConnector` usage at the call site).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::MtlsIdentity;

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("reading certs from {}: {e}", path.display()))
}

pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Builds the `TlsConnector` the agent uses for every dial attempt, and
/// the `ServerName` the handshake must authenticate against (the
/// operator-configured `expected_server_identity`, not whatever
/// `remote_addr` happens to resolve to).
pub fn build_connector(identity: &MtlsIdentity) -> anyhow::Result<(TlsConnector, ServerName<'static>)> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&identity.ca_path)? {
        roots.add(cert)?;
    }

    let client_certs = load_certs(&identity.cert_path)?;
    let client_key = load_private_key(&identity.key_path)?;

    let cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| anyhow::anyhow!("building client TLS config: {e}"))?;

    let server_name = ServerName::try_from(identity.expected_server_identity.clone())
        .map_err(|_| anyhow::anyhow!("invalid expected_server_identity: {}", identity.expected_server_identity))?;

    Ok((TlsConnector::from(Arc::new(cfg)), server_name))
}
