//! TLS termination for stream listeners.
//!
//! Key material is configured as PEM content, not paths, so secrets can be
//! injected through the config management layer without touching disk. When an
//! authority certificate is present, client certificates are required and
//! validated against it.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::ListenerError;

fn parse_certs(pem: &str, field: &str) -> Result<Vec<CertificateDer<'static>>, ListenerError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ListenerError::Tls(format!("{field}: {e}")))?;

    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "{field}: no certificates in PEM"
        )));
    }

    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, ListenerError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ListenerError::Tls(format!("tls_key: {e}")))?
        .ok_or_else(|| ListenerError::Tls("tls_key: no private key in PEM".to_owned()))
}

/// Builds a TLS acceptor from PEM key material.
///
/// `authority` enables mandatory client-certificate verification.
pub fn make_tls_acceptor(
    key_pem: &str,
    cert_pem: &str,
    authority: Option<&str>,
) -> Result<TlsAcceptor, ListenerError> {
    let certs = parse_certs(cert_pem, "tls_certificate")?;
    let key = parse_key(key_pem)?;

    let builder = ServerConfig::builder();

    let config = match authority {
        Some(authority_pem) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(authority_pem, "tls_authority_certificate")? {
                roots
                    .add(cert)
                    .map_err(|e| ListenerError::Tls(format!("tls_authority_certificate: {e}")))?;
            }

            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ListenerError::Tls(format!("tls_authority_certificate: {e}")))?;

            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| ListenerError::Tls(format!("tls_certificate: {e}")))?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ListenerError::Tls(format!("tls_certificate: {e}")))?,
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}
