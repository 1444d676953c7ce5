//! External port multiplexer.
//!
//! The first packet a client sends picks one of the local relay sockets;
//! that packet is replayed to the relay and the two connections are spliced
//! until they close.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::watch;

use crate::error::ErrorSink;
use crate::listener::SocketAddressSet;
use crate::proxy::parse::InitialPacket;
use crate::proxy::relay::{RelaySide, relay};
use crate::proxy::server::{Accepted, ServerSocket, accept_loop};
use crate::proxy_log;

pub(crate) const EXTERNAL_ORIGIN: &str = "external-server";
pub(crate) const CLIENT_SOCKET_ORIGIN: &str = "external-server-socket";

pub(crate) struct Multiplexer {
    sockets: SocketAddressSet,
    errors: ErrorSink,
}

impl Multiplexer {
    pub(crate) fn new(sockets: SocketAddressSet, errors: ErrorSink) -> Arc<Self> {
        Arc::new(Self { sockets, errors })
    }

    pub(crate) async fn serve(self: Arc<Self>, socket: ServerSocket, shutdown: watch::Receiver<bool>) {
        let errors = self.errors.clone();
        accept_loop(socket, shutdown, errors, EXTERNAL_ORIGIN.to_string(), move |conn| {
            let this = self.clone();
            async move {
                match conn {
                    Accepted::Tcp(s) => {
                        let _ = s.set_nodelay(true);
                        this.dispatch(s).await
                    }
                    Accepted::Unix(s) => this.dispatch(s).await,
                }
            }
        })
        .await;
    }

    async fn dispatch<S>(self: Arc<Self>, mut inbound: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = match InitialPacket::read(&mut inbound).await {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(e) => {
                self.errors.emit(e, CLIENT_SOCKET_ORIGIN);
                return;
            }
        };
        let Some(protocol) = packet.protocol() else {
            return;
        };
        let target = self.sockets.for_protocol(protocol);
        proxy_log!(
            "[external] {:?} ({}B) -> {}",
            protocol,
            packet.data.len(),
            target.display()
        );
        let relay_socket = match UnixStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                self.errors.emit(e, protocol.relay_origin());
                return;
            }
        };
        if let Err(e) = relay(inbound, relay_socket, &packet.data).await {
            let origin = match e.side {
                RelaySide::A => CLIENT_SOCKET_ORIGIN,
                RelaySide::B => protocol.relay_origin(),
            };
            self.errors.emit(e.source, origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixListener};

    async fn read_n(listener: &UnixListener, n: usize) -> Vec<u8> {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; n];
        s.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn first_byte_selects_relay_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let sockets = SocketAddressSet::new(tmp.path());
        let http = UnixListener::bind(&sockets.http).unwrap();
        let https = UnixListener::bind(&sockets.https).unwrap();
        let tunnel = UnixListener::bind(&sockets.tunnel_connect).unwrap();

        let socket = ServerSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.tcp_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(Multiplexer::new(sockets, ErrorSink::discard()).serve(socket, stop_rx));

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        c1.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(read_n(&http, 18).await, b"GET / HTTP/1.1\r\n\r\n");

        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
        assert_eq!(read_n(&https, 3).await, [0x16, 0x03, 0x01]);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        c3.write_all(b"CONNECT a:443 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(read_n(&tunnel, 7).await, b"CONNECT");
    }

    #[tokio::test]
    async fn missing_relay_socket_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let sockets = SocketAddressSet::new(tmp.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let errors = ErrorSink::new(move |e| seen_in.lock().unwrap().push(e));

        let socket = ServerSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.tcp_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(Multiplexer::new(sockets, errors).serve(socket, stop_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        // relay never opens, so the client is simply closed
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin(), "external-server-http");
    }
}
