//! TLS bootstrap for the listener.
//!
//! Mutual TLS is not optional: the server verifies every client against the
//! CA bundle and the CommonName of the presented certificate becomes the
//! session's agent identity. rustls already restricts cipher suites to the
//! AEAD ECDHE families.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

/// Reads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Reads the first private key in a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Builds the server-side TLS config: our certificate chain plus REQUIRED
/// client verification against the CA bundle.
pub fn server_tls_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca)? {
        roots
            .add(ca_cert)
            .context("add CA certificate to trust store")?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .context("assemble server TLS config")?;
    Ok(Arc::new(config))
}

/// Extracts the CommonName from the peer's leaf certificate, if any.
pub fn peer_common_name(conn: &rustls::ServerConnection) -> Option<String> {
    let certs = conn.peer_certificates()?;
    let leaf = certs.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Fallback identity for a peer whose certificate carries no CN. Such a
/// session stays connected but every message fails the binding rule.
pub fn anonymous_identity(peer: std::net::SocketAddr) -> String {
    format!("unknown_{}_{}", peer.ip(), peer.port())
}
