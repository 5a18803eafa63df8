//! Server-side mTLS acceptor setup (spec §4.2: "Responder startup:
//! accept TCP, perform TLS, require client certificate... check that
//! the presented certificate's common name / SAN matches the expected
//! peer identity. On mismatch -> close, no data sent.").
//!
//! rustls's stock `WebPkiClientVerifier` checks the chain against the
//! configured CA but has no notion of "expected identity" for a client
//! cert (that concept only exists client-side, via `ServerName`). The
//! CN/SAN check is added here as a thin wrapper, modeled on the
//! trust-domain verifier pattern in `vishalbelsare-agentgateway`'s
//! transport/tls.rs.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::TlsAcceptor;

use crate::config::MtlsIdentity;

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("parsing certs in {}: {e}", path.display()))
}

pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| anyhow::anyhow!("opening {}: {e}", path.display()))?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("parsing private key in {}: {e}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Wraps a base [`ClientCertVerifier`] with an additional check that
/// the leaf certificate's CN or a DNS SAN matches `expected_identity`.
#[derive(Debug)]
struct IdentityPinnedVerifier {
    base: Arc<dyn ClientCertVerifier>,
    expected_identity: String,
}

impl IdentityPinnedVerifier {
    fn names_match(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

        let cn_matches = cert
            .subject()
            .iter_common_name()
            .filter_map(|a| a.as_str().ok())
            .any(|cn| cn == self.expected_identity);
        if cn_matches {
            return Ok(());
        }

        let san_matches = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|ext| {
                ext.value.general_names.iter().any(|name| match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => *dns == self.expected_identity,
                    _ => false,
                })
            })
            .unwrap_or(false);

        if san_matches {
            Ok(())
        } else {
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(Arc::new(
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("client certificate identity does not match expected `{}`", self.expected_identity),
                ),
            )))))
        }
    }
}

impl ClientCertVerifier for IdentityPinnedVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.base.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self.base.verify_client_cert(end_entity, intermediates, now)?;
        self.names_match(end_entity)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.base.supported_verify_schemes()
    }
}

pub fn build_acceptor(identity: &MtlsIdentity) -> anyhow::Result<TlsAcceptor> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&identity.ca_path)? {
        roots.add(cert)?;
    }
    let roots = Arc::new(roots);

    let base_verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| anyhow::anyhow!("building client cert verifier: {e}"))?;
    let verifier = Arc::new(IdentityPinnedVerifier {
        base: base_verifier,
        expected_identity: identity.expected_client_identity.clone(),
    });

    let certs = load_certs(&identity.cert_path)?;
    let key = load_private_key(&identity.key_path)?;

    let cfg = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("building server TLS config: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(cfg)))
}
