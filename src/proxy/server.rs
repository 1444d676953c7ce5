use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;

use crate::error::ErrorSink;
use crate::proxy_log;

/// A bound listening socket, either the external TCP port or a local
/// relay socket.
#[derive(Debug)]
pub(crate) enum ServerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub(crate) enum Accepted {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ServerSocket {
    pub(crate) async fn bind_tcp(addr: SocketAddr) -> io::Result<Self> {
        TcpListener::bind(addr).await.map(ServerSocket::Tcp)
    }

    pub(crate) async fn bind_unix(path: PathBuf) -> io::Result<Self> {
        UnixListener::bind(&path).map(ServerSocket::Unix)
    }

    pub(crate) fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerSocket::Tcp(l) => l.local_addr().ok(),
            ServerSocket::Unix(_) => None,
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<Accepted> {
        match self {
            ServerSocket::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Accepted::Tcp(stream))
            }
            ServerSocket::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }
}

/// Accepts until `shutdown` flips to true or its sender goes away. Each
/// connection runs on its own task and outlives the loop.
pub(crate) async fn accept_loop<F, Fut>(
    socket: ServerSocket,
    mut shutdown: watch::Receiver<bool>,
    errors: ErrorSink,
    origin: String,
    on_conn: F,
) where
    F: Fn(Accepted) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
            accepted = socket.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(on_conn(conn));
                }
                Err(e) => {
                    errors.emit(e, &origin);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }
    proxy_log!("[server] {} stopped accepting", origin);
}
