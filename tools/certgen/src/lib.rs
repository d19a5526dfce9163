//! Development PKI for HoneyGrid.
//!
//! Mints a throwaway CA plus a server certificate and one client certificate
//! per agent. The client CommonName IS the agent identity: the collector
//! binds every message on a session to the CN presented during the TLS
//! handshake, so certificates must be issued with CN = agent id.
//!
//! This is a convenience for development and tests; production deployments
//! bring their own issuance tooling.

use anyhow::{Context, Result};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

/// A certificate and its private key, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct Pem {
    pub cert: String,
    pub key: String,
}

/// A complete development PKI.
#[derive(Debug, Clone)]
pub struct PkiBundle {
    pub ca: Pem,
    pub server: Pem,
    /// `(agent_id, certificate)` pairs; CN equals the agent id.
    pub clients: Vec<(String, Pem)>,
}

/// Generates a CA, a server certificate valid for `server_sans`, and a
/// client certificate per agent id.
pub fn generate(server_name: &str, server_sans: &[String], agent_ids: &[String]) -> Result<PkiBundle> {
    let ca_key = KeyPair::generate().context("generate CA key")?;
    let mut ca_params =
        CertificateParams::new(Vec::<String>::new()).context("CA certificate params")?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "HoneyGrid Dev CA");
    let ca_cert = ca_params.self_signed(&ca_key).context("self-sign CA")?;

    let server_key = KeyPair::generate().context("generate server key")?;
    let mut server_params =
        CertificateParams::new(server_sans.to_vec()).context("server certificate params")?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, server_name);
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("sign server certificate")?;

    let mut clients = Vec::with_capacity(agent_ids.len());
    for agent_id in agent_ids {
        let client_key = KeyPair::generate().context("generate client key")?;
        let mut client_params =
            CertificateParams::new(Vec::<String>::new()).context("client certificate params")?;
        client_params
            .distinguished_name
            .push(DnType::CommonName, agent_id);
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .with_context(|| format!("sign client certificate for {agent_id}"))?;
        clients.push((
            agent_id.clone(),
            Pem {
                cert: client_cert.pem(),
                key: client_key.serialize_pem(),
            },
        ));
    }

    Ok(PkiBundle {
        ca: Pem {
            cert: ca_cert.pem(),
            key: ca_key.serialize_pem(),
        },
        server: Pem {
            cert: server_cert.pem(),
            key: server_key.serialize_pem(),
        },
        clients,
    })
}

/// Default SANs for a loopback collector.
pub fn loopback_sans() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}
