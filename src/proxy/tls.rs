use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig as RustlsServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsCert;
use crate::error::{ProxyError, Result};

/// TLS acceptor terminating client connections with the configured pair.
/// Only `http/1.1` is offered; the internal servers do not speak h2.
pub(crate) fn build_acceptor(pair: &TlsCert) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut pair.cert.as_slice())
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| ProxyError::Tls(format!("invalid certificate pem: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificate found in pem".into()));
    }
    let key = rustls_pemfile::private_key(&mut pair.key.as_slice())
        .map_err(|e| ProxyError::Tls(format!("invalid key pem: {e}")))?
        .ok_or_else(|| ProxyError::Tls("no private key found in pem".into()))?;
    let mut server_cfg = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    server_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(server_cfg)))
}

/// Client config used toward origin servers.
pub(crate) fn build_client_config(accept_invalid_certs: bool) -> ClientConfig {
    if accept_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Connector used toward origin servers.
pub(crate) fn build_connector(accept_invalid_certs: bool) -> TlsConnector {
    TlsConnector::from(Arc::new(build_client_config(accept_invalid_certs)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_from_fallback_pair() {
        let pair = crate::ca::fallback_certificate().unwrap();
        assert!(build_acceptor(&pair).is_ok());
    }

    #[test]
    fn acceptor_rejects_garbage() {
        let Err(err) = build_acceptor(&TlsCert::new("nope", "nope")) else {
            panic!("garbage pem built an acceptor");
        };
        assert!(matches!(err, ProxyError::Tls(_)));
    }
}
