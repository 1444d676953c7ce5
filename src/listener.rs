//! Listener: the external port plus the three local servers behind it.
//!
//! ```text
//! client ──tcp──> multiplexer ──unix──> internal-http
//!                             ──unix──> internal-https (tls)
//!                             ──unix──> tunnel bridge ──unix──> internal-https
//! ```
//!
//! When the socket directory cannot be prepared the listener falls back to a
//! single plain HTTP server on the external port.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ca;
use crate::config::ListenerConfig;
use crate::error::{ErrorSink, ProxyError, Result};
use crate::fs_env;
use crate::proxy::RequestHandler;
use crate::proxy::external::Multiplexer;
use crate::proxy::internal::{FALLBACK_SERVER, HTTP_SERVER, HTTPS_SERVER, InternalServer};
use crate::proxy::parse::Protocol;
use crate::proxy::server::ServerSocket;
use crate::proxy::tls::build_acceptor;
use crate::proxy::tunnel::TunnelBridge;
use crate::{proxy_log, wait};

pub(crate) const FAKE_CERTIFICATE_ORIGIN: &str = "fakecertificate";
pub(crate) const HTTP_FALLBACK_ORIGIN: &str = "http-fallback";

/// Paths of the local relay sockets inside the socket directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddressSet {
    pub http: PathBuf,
    pub https: PathBuf,
    pub tunnel_connect: PathBuf,
}

impl SocketAddressSet {
    pub fn new(dir: &Path) -> Self {
        Self {
            http: dir.join("http"),
            https: dir.join("https"),
            tunnel_connect: dir.join("https-tunnel-connect"),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.http, &self.https, &self.tunnel_connect]
    }

    pub(crate) fn for_protocol(&self, protocol: Protocol) -> &Path {
        match protocol {
            Protocol::TunnelConnect => &self.tunnel_connect,
            Protocol::TlsClientHello => &self.https,
            Protocol::PlainHttp => &self.http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Multiplexer with plain, TLS and CONNECT handling.
    Full,
    /// Plain HTTP only, served directly on the external port.
    HttpFallback,
}

#[derive(Debug, thiserror::Error)]
#[error("no tls certificate configured, using the built-in localhost certificate")]
struct FakeCertificate;

type BindFuture = Pin<Box<dyn Future<Output = io::Result<ServerSocket>> + Send>>;

pub struct Listener {
    config: ListenerConfig,
    sockets: SocketAddressSet,
    handler: Arc<dyn RequestHandler>,
    errors: ErrorSink,
}

impl Listener {
    pub fn new(config: ListenerConfig, handler: Arc<dyn RequestHandler>, errors: ErrorSink) -> Self {
        let sockets = SocketAddressSet::new(&config.socket_dir);
        Self {
            config,
            sockets,
            handler,
            errors,
        }
    }

    pub fn sockets(&self) -> &SocketAddressSet {
        &self.sockets
    }

    /// Binds everything and starts serving. Returns once every socket is
    /// bound. Port `0` picks a free port; see [`ListenerHandle::local_addr`].
    pub async fn listen(&self, port: u16) -> Result<ListenerHandle> {
        let addr = SocketAddr::new(self.config.bind_addr, port);
        if let Err(source) = self.prepare_socket_dir() {
            self.errors.emit(
                ProxyError::SocketDir {
                    path: self.config.socket_dir.clone(),
                    source,
                },
                HTTP_FALLBACK_ORIGIN,
            );
            return self.listen_fallback(addr).await;
        }

        let configured = match &self.config.tls_cert {
            Some(pair) => Some(build_acceptor(pair)?),
            None => None,
        };
        let binds: Vec<BindFuture> = vec![
            Box::pin(ServerSocket::bind_unix(self.sockets.http.clone())),
            Box::pin(ServerSocket::bind_unix(self.sockets.https.clone())),
            Box::pin(ServerSocket::bind_unix(self.sockets.tunnel_connect.clone())),
            Box::pin(ServerSocket::bind_tcp(addr)),
        ];
        let mut bound = wait::parallel(binds).await.into_iter();
        let (Some(Some(http)), Some(Some(https)), Some(Some(tunnel)), Some(Some(external))) =
            (bound.next(), bound.next(), bound.next(), bound.next())
        else {
            return Err(ProxyError::Io(io::Error::other("socket bind results missing")));
        };
        let external = external.map_err(|source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let (http, https, tunnel) = match (http, https, tunnel) {
            (Ok(http), Ok(https), Ok(tunnel)) => (http, https, tunnel),
            (Err(source), _, _) | (_, Err(source), _) | (_, _, Err(source)) => {
                self.errors.emit(
                    ProxyError::SocketDir {
                        path: self.config.socket_dir.clone(),
                        source,
                    },
                    HTTP_FALLBACK_ORIGIN,
                );
                return Ok(self.serve_fallback(external));
            }
        };

        let acceptor = match configured {
            Some(acceptor) => acceptor,
            None => {
                self.errors.emit(FakeCertificate, FAKE_CERTIFICATE_ORIGIN);
                build_acceptor(&ca::fallback_certificate()?)?
            }
        };

        let local_addr = external.tcp_addr().unwrap_or(addr);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_server = InternalServer::plain(HTTP_SERVER, self.handler.clone(), self.errors.clone());
        let https_server =
            InternalServer::tls(HTTPS_SERVER, acceptor, self.handler.clone(), self.errors.clone());
        let bridge = TunnelBridge::new(self.sockets.https.clone(), self.errors.clone());
        let multiplexer = Multiplexer::new(self.sockets.clone(), self.errors.clone());
        let servers = vec![
            tokio::spawn(http_server.serve(http, shutdown_rx.clone())),
            tokio::spawn(https_server.serve(https, shutdown_rx.clone())),
            tokio::spawn(bridge.serve(tunnel, shutdown_rx.clone())),
            tokio::spawn(multiplexer.serve(external, shutdown_rx)),
        ];
        proxy_log!(
            "[listener] listening on {} (sockets in {})",
            local_addr,
            self.config.socket_dir.display()
        );
        Ok(ListenerHandle {
            local_addr,
            mode: ListenerMode::Full,
            shutdown_tx,
            servers,
        })
    }

    fn prepare_socket_dir(&self) -> io::Result<()> {
        fs_env::ensure_dir(&self.config.socket_dir)?;
        for path in self.sockets.all() {
            fs_env::remove_if_exists(path)?;
        }
        Ok(())
    }

    async fn listen_fallback(&self, addr: SocketAddr) -> Result<ListenerHandle> {
        let external = ServerSocket::bind_tcp(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(self.serve_fallback(external))
    }

    fn serve_fallback(&self, external: ServerSocket) -> ListenerHandle {
        let local_addr = external
            .tcp_addr()
            .unwrap_or_else(|| SocketAddr::new(self.config.bind_addr, 0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = InternalServer::plain(FALLBACK_SERVER, self.handler.clone(), self.errors.clone());
        proxy_log!("[listener] plain http fallback on {}", local_addr);
        ListenerHandle {
            local_addr,
            mode: ListenerMode::HttpFallback,
            shutdown_tx,
            servers: vec![tokio::spawn(server.serve(external, shutdown_rx))],
        }
    }
}

/// Running listener. Dropping the handle stops accepting as well.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    mode: ListenerMode,
    shutdown_tx: watch::Sender<bool>,
    servers: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Stops accepting on every socket and waits until all accept loops
    /// have exited. Connections already accepted run to completion.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = wait::parallel(self.servers).await;
        proxy_log!("[listener] closed {}", self.local_addr);
    }
}
