//! Bidirectional byte relay between two duplex streams.
//!
//! Half-close is tracked per direction. When `a` reaches EOF the write side
//! of `b` is shut down and nothing more is written to `a`; the relay then
//! finishes and both streams are dropped. When `b` reaches EOF the write side
//! of `a` is shut down and later bytes from `a` are discarded instead of
//! being written into the ended stream.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

const RELAY_BUF: usize = 16 * 1024;

/// Which of the two relayed streams failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelaySide {
    A,
    B,
}

#[derive(Debug)]
pub(crate) struct RelayError {
    pub(crate) side: RelaySide,
    pub(crate) source: io::Error,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

fn on(side: RelaySide) -> impl FnOnce(io::Error) -> RelayError {
    move |source| RelayError { side, source }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayStats {
    pub(crate) a_to_b: u64,
    pub(crate) b_to_a: u64,
}

/// Relays until `a` ends, or until both directions have ended.
/// `initial` is written to `b` before anything read from `a`.
pub(crate) async fn relay<A, B>(
    a: A,
    b: B,
    initial: &[u8],
) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_r, mut a_w) = tokio::io::split(a);
    let (mut b_r, mut b_w) = tokio::io::split(b);

    if !initial.is_empty() {
        b_w.write_all(initial).await.map_err(on(RelaySide::B))?;
    }

    let (a_ended_tx, mut a_ended) = watch::channel(false);
    let (b_ended_tx, b_ended) = watch::channel(false);

    let a_to_b = async {
        let mut buf = vec![0u8; RELAY_BUF];
        let mut total = initial.len() as u64;
        loop {
            let n = a_r.read(&mut buf).await.map_err(on(RelaySide::A))?;
            if n == 0 {
                let _ = a_ended_tx.send(true);
                if !*b_ended.borrow() {
                    let _ = b_w.shutdown().await;
                }
                break;
            }
            if *b_ended.borrow() {
                continue;
            }
            b_w.write_all(&buf[..n]).await.map_err(on(RelaySide::B))?;
            total += n as u64;
        }
        Ok::<u64, RelayError>(total)
    };

    let b_to_a = async {
        let mut buf = vec![0u8; RELAY_BUF];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                read = b_r.read(&mut buf) => read.map_err(on(RelaySide::B))?,
                _ = a_ended.wait_for(|ended| *ended) => break,
            };
            if n == 0 {
                let _ = b_ended_tx.send(true);
                let _ = a_w.shutdown().await;
                break;
            }
            a_w.write_all(&buf[..n]).await.map_err(on(RelaySide::A))?;
            total += n as u64;
        }
        Ok::<u64, RelayError>(total)
    };

    let (a_to_b, b_to_a) = tokio::try_join!(a_to_b, b_to_a)?;
    Ok(RelayStats { a_to_b, b_to_a })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_some(s: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = s.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn initial_bytes_then_both_directions() {
        let (a_local, mut a_remote) = duplex(4096);
        let (b_local, mut b_remote) = duplex(4096);
        let task = tokio::spawn(async move { relay(a_local, b_local, b"hello").await });

        assert_eq!(read_some(&mut b_remote).await, b"hello");
        a_remote.write_all(b"ping").await.unwrap();
        assert_eq!(read_some(&mut b_remote).await, b"ping");
        b_remote.write_all(b"pong").await.unwrap();
        assert_eq!(read_some(&mut a_remote).await, b"pong");

        a_remote.shutdown().await.unwrap();
        // a ended: b sees EOF and the relay finishes
        assert!(read_some(&mut b_remote).await.is_empty());
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 9);
        assert_eq!(stats.b_to_a, 4);
    }

    #[tokio::test]
    async fn b_eof_ends_a_and_discards_late_writes() {
        let (a_local, mut a_remote) = duplex(4096);
        let (b_local, mut b_remote) = duplex(4096);
        let task = tokio::spawn(async move { relay(a_local, b_local, b"").await });

        b_remote.write_all(b"response").await.unwrap();
        b_remote.shutdown().await.unwrap();
        assert_eq!(read_some(&mut a_remote).await, b"response");
        assert!(read_some(&mut a_remote).await.is_empty());

        // late bytes from a are dropped, not an error
        a_remote.write_all(b"late").await.unwrap();
        a_remote.shutdown().await.unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 0);
        assert_eq!(stats.b_to_a, 8);
    }
}
