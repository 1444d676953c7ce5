//! CONNECT bridge: answers the tunnel request itself and splices the client
//! onto the internal HTTPS server, which then terminates TLS.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;

use crate::error::ErrorSink;
use crate::proxy::parse::{HeadError, read_request_head};
use crate::proxy::relay::relay;
use crate::proxy::server::{Accepted, ServerSocket, accept_loop};
use crate::proxy_log;

pub(crate) const TUNNEL_ORIGIN: &str = "tunnel-connect";

pub(crate) const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nProxy-Agent: reworse\r\n\r\n";
const METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

pub(crate) struct TunnelBridge {
    https_socket: PathBuf,
    errors: ErrorSink,
}

impl TunnelBridge {
    pub(crate) fn new(https_socket: PathBuf, errors: ErrorSink) -> Arc<Self> {
        Arc::new(Self {
            https_socket,
            errors,
        })
    }

    pub(crate) async fn serve(self: Arc<Self>, socket: ServerSocket, shutdown: watch::Receiver<bool>) {
        let errors = self.errors.clone();
        accept_loop(socket, shutdown, errors, TUNNEL_ORIGIN.to_string(), move |conn| {
            let this = self.clone();
            async move {
                match conn {
                    Accepted::Unix(s) => this.bridge(s).await,
                    Accepted::Tcp(s) => this.bridge(s).await,
                }
            }
        })
        .await;
    }

    async fn bridge<S>(self: Arc<Self>, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = match read_request_head(&mut stream).await {
            Ok(head) => head,
            Err(HeadError::Closed) => return,
            Err(e) => {
                self.errors.emit(e, TUNNEL_ORIGIN);
                return;
            }
        };
        if !head.is_connect() {
            proxy_log!("[tunnel] rejecting {} {}", head.method, head.target);
            let _ = stream.write_all(METHOD_NOT_ALLOWED).await;
            let _ = stream.shutdown().await;
            return;
        }
        proxy_log!("[tunnel] CONNECT {}", head.target);
        if let Err(e) = stream.write_all(CONNECT_ESTABLISHED).await {
            self.errors.emit(e, TUNNEL_ORIGIN);
            return;
        }
        let data = match UnixStream::connect(&self.https_socket).await {
            Ok(s) => s,
            Err(e) => {
                self.errors.emit(e, TUNNEL_ORIGIN);
                return;
            }
        };
        match relay(stream, data, &head.rest).await {
            Ok(stats) => proxy_log!(
                "[tunnel] {} closed: {}B up, {}B down",
                head.target,
                stats.a_to_b,
                stats.b_to_a
            ),
            Err(e) => self.errors.emit(e.source, TUNNEL_ORIGIN),
        }
    }
}
