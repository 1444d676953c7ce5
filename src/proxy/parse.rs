use bytes::Bytes;
use memchr::{memchr, memmem};
use tokio::io::{AsyncRead, AsyncReadExt};

const INITIAL_PACKET_MAX: usize = 64 * 1024;
const HEAD_MAX: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Traffic class decided from the first byte a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    /// `C`, the start of a `CONNECT` request line.
    TunnelConnect,
    /// `0x16`, a TLS handshake record.
    TlsClientHello,
    PlainHttp,
}

impl Protocol {
    pub(crate) fn sniff(first: u8) -> Self {
        match first {
            b'C' => Protocol::TunnelConnect,
            0x16 => Protocol::TlsClientHello,
            _ => Protocol::PlainHttp,
        }
    }

    /// Origin tag for failures of the local relay connection.
    pub(crate) fn relay_origin(&self) -> &'static str {
        match self {
            Protocol::TunnelConnect => "external-server-tunnel-connect",
            Protocol::TlsClientHello => "external-server-https",
            Protocol::PlainHttp => "external-server-http",
        }
    }
}

/// The first chunk read from a client, replayed verbatim to the relay.
#[derive(Debug, Clone)]
pub(crate) struct InitialPacket {
    pub(crate) data: Vec<u8>,
}

impl InitialPacket {
    /// `None` when the client closed before sending anything.
    pub(crate) async fn read<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> std::io::Result<Option<Self>> {
        let mut data = vec![0u8; INITIAL_PACKET_MAX];
        let n = reader.read(&mut data).await?;
        if n == 0 {
            return Ok(None);
        }
        data.truncate(n);
        Ok(Some(Self { data }))
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        self.data.first().copied().map(Protocol::sniff)
    }

    pub(crate) fn first_line(&self) -> String {
        let end = memchr(b'\n', &self.data).unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).trim_end().to_string()
    }
}

/// Request head read off a tunnel connection, plus whatever followed it in
/// the same reads.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) rest: Bytes,
}

impl RequestHead {
    pub(crate) fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HeadError {
    #[error("connection closed before the request head was complete")]
    Closed,
    #[error("request head larger than {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads until the blank line ending the head and parses the request line.
pub(crate) async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RequestHead, HeadError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = vec![0u8; 4096];
    let head_end = loop {
        if let Some(pos) = memmem::find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > HEAD_MAX {
            return Err(HeadError::TooLarge(HEAD_MAX));
        }
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&buf[..head_end])?;
    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let rest = Bytes::copy_from_slice(&buf[head_end..]);
    Ok(RequestHead {
        method,
        target,
        rest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing_first_byte() {
        assert_eq!(Protocol::sniff(b'C'), Protocol::TunnelConnect);
        assert_eq!(Protocol::sniff(0x16), Protocol::TlsClientHello);
        assert_eq!(Protocol::sniff(b'G'), Protocol::PlainHttp);
        assert_eq!(Protocol::sniff(b'c'), Protocol::PlainHttp);
        assert_eq!(Protocol::sniff(0), Protocol::PlainHttp);
        let tunnels = (0..=255u8)
            .filter(|b| Protocol::sniff(*b) == Protocol::TunnelConnect)
            .count();
        let tls = (0..=255u8)
            .filter(|b| Protocol::sniff(*b) == Protocol::TlsClientHello)
            .count();
        assert_eq!((tunnels, tls), (1, 1));
    }

    #[tokio::test]
    async fn initial_packet_read() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let packet = InitialPacket::read(&mut input).await.unwrap().unwrap();
        assert_eq!(packet.protocol(), Some(Protocol::PlainHttp));
        assert_eq!(packet.first_line(), "GET / HTTP/1.1");

        let mut empty: &[u8] = b"";
        assert!(InitialPacket::read(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_head_keeps_trailing_bytes() {
        let mut input: &[u8] =
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01";
        let head = read_request_head(&mut input).await.unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(&head.rest[..], b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"CONNECT a:1 HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: a:1\r\n\r\n").await.unwrap();
            client
        });
        let head = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert!(head.rest.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn truncated_head_is_closed_error() {
        let mut input: &[u8] = b"CONNECT a:1 HTTP/1.1\r\n";
        assert!(matches!(
            read_request_head(&mut input).await,
            Err(HeadError::Closed)
        ));
    }
}
