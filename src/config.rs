//! Startup configuration consumed by the listener and the forward engine.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, Result};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_SOCKET_DIR: &str = ".tmp";

/// PEM encoded private key and certificate chain.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsCert {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl TlsCert {
    pub fn new(key: impl Into<Vec<u8>>, cert: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
        }
    }

    /// Reads the pair from disk. Failures are reported as
    /// [`ProxyError::TlsFile`] so the caller can treat them as fatal.
    pub fn from_files(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let key = std::fs::read(key_path).map_err(|source| ProxyError::TlsFile {
            kind: "key",
            path: key_path.to_path_buf(),
            source,
        })?;
        let cert = std::fs::read(cert_path).map_err(|source| ProxyError::TlsFile {
            kind: "certificate",
            path: cert_path.to_path_buf(),
            source,
        })?;
        Ok(Self { key, cert })
    }
}

impl std::fmt::Debug for TlsCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCert")
            .field("key", &"***")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

/// Per-exchange limits applied by the forward engine. Nothing is limited by
/// default: a stalled upstream keeps its exchange open.
#[derive(Debug, Clone, Default)]
pub struct ExchangePolicy {
    /// Upper bound on waiting for the upstream response head.
    pub upstream_timeout: Option<Duration>,
}

/// Listener-side settings; immutable once the listener is created.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub tls_cert: Option<TlsCert>,
    pub socket_dir: PathBuf,
    /// Interface the external port is bound on.
    pub bind_addr: IpAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tls_cert: None,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub port: u16,
    pub listener: ListenerConfig,
    pub verbose: bool,
    /// Skip certificate verification toward origin servers. The proxy is a
    /// deliberate man in the middle, so this is on unless asked otherwise.
    pub accept_invalid_upstream_certs: bool,
    pub exchange_policy: ExchangePolicy,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            listener: ListenerConfig::default(),
            verbose: false,
            accept_invalid_upstream_certs: true,
            exchange_policy: ExchangePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ProxyOptions::default();
        assert_eq!(opts.port, 9000);
        assert_eq!(opts.listener.socket_dir, PathBuf::from(".tmp"));
        assert!(opts.listener.tls_cert.is_none());
        assert!(opts.listener.bind_addr.is_loopback());
        assert!(opts.accept_invalid_upstream_certs);
        assert!(opts.exchange_policy.upstream_timeout.is_none());
    }

    #[test]
    fn missing_tls_file_is_a_tls_file_error() {
        let tmp = tempfile::tempdir().unwrap();
        let key = tmp.path().join("key.pem");
        std::fs::write(&key, b"k").unwrap();
        let err = TlsCert::from_files(&key, &tmp.path().join("nope.pem")).unwrap_err();
        match err {
            ProxyError::TlsFile { kind, .. } => assert_eq!(kind, "certificate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reads_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let key = tmp.path().join("key.pem");
        let cert = tmp.path().join("cert.pem");
        std::fs::write(&key, b"k").unwrap();
        std::fs::write(&cert, b"c").unwrap();
        let pair = TlsCert::from_files(&key, &cert).unwrap();
        assert_eq!(pair, TlsCert::new("k", "c"));
        assert!(format!("{pair:?}").contains("***"));
    }
}
