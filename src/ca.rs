//! Fallback certificate used when no key/cert pair is configured.
//!
//! The pair is self-signed for `localhost`, generated once per process and
//! shared by every listener. Clients will not trust it; it only lets TLS
//! termination work for local development.

use once_cell::sync::Lazy;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::config::TlsCert;
use crate::error::{ProxyError, Result};

const FALLBACK_COMMON_NAME: &str = "reworse fake certificate";

static FALLBACK_CERT: Lazy<std::result::Result<TlsCert, String>> =
    Lazy::new(|| generate_fallback().map_err(|e| e.to_string()));

fn generate_fallback() -> Result<TlsCert> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params.is_ca = IsCa::NoCa;
    let now = OffsetDateTime::now_utc();
    params.not_before = now.saturating_sub(Duration::days(1));
    params.not_after = params
        .not_before
        .checked_add(Duration::days(397))
        .ok_or_else(|| ProxyError::Tls("failed to compute certificate validity".into()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, FALLBACK_COMMON_NAME);
    params.distinguished_name = dn;
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let cert = Certificate::from_params(params).map_err(|e| ProxyError::Tls(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    let key_pem = cert.serialize_private_key_pem();
    Ok(TlsCert::new(key_pem, cert_pem))
}

/// The process-wide fallback pair.
pub fn fallback_certificate() -> Result<TlsCert> {
    FALLBACK_CERT.clone().map_err(ProxyError::Tls)
}
