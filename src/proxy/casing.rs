//! Header-name casing on the wire.
//!
//! hyper lowercases names when it parses a head and writes them lowercase or
//! Title-Case. [`CaseTap`] sits between hyper and the socket: it keeps the
//! first message head it reads, so the names can be recovered as they
//! arrived, and it rewrites the names of the head hyper writes to the casing
//! the exchange carries.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::headers::{Header, HeaderSet};

const HEAD_MAX: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Headers of a message as they were received, names untouched.
#[derive(Debug, Clone)]
pub(crate) struct RawHeaders(pub(crate) HeaderSet);

/// Lowercase name to the casing it should be written with.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderCasing(HashMap<String, String>);

impl HeaderCasing {
    pub(crate) fn of(headers: &HeaderSet) -> Self {
        Self(
            headers
                .raw()
                .iter()
                .map(|h| (h.name.to_ascii_lowercase(), h.name.clone()))
                .collect(),
        )
    }

    fn get(&self, name: &[u8]) -> Option<&str> {
        let lower = String::from_utf8_lossy(name).to_ascii_lowercase();
        self.0.get(&lower).map(String::as_str)
    }
}

#[derive(Default)]
struct TapShared {
    received: Vec<u8>,
    complete: bool,
    casing: HeaderCasing,
}

/// Shared view of a [`CaseTap`], kept by whoever drives hyper over it.
#[derive(Clone, Default)]
pub(crate) struct TapHandle(Arc<Mutex<TapShared>>);

impl TapHandle {
    fn lock(&self) -> MutexGuard<'_, TapShared> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Casing applied to the next head written through the tap.
    pub(crate) fn set_casing(&self, casing: HeaderCasing) {
        self.lock().casing = casing;
    }

    pub(crate) fn request_headers(&self) -> Option<HeaderSet> {
        let shared = self.lock();
        if !shared.complete {
            return None;
        }
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        match req.parse(&shared.received) {
            Ok(httparse::Status::Complete(_)) => Some(collect(req.headers)),
            _ => None,
        }
    }

    pub(crate) fn response_headers(&self) -> Option<HeaderSet> {
        let shared = self.lock();
        if !shared.complete {
            return None;
        }
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut slots);
        match resp.parse(&shared.received) {
            Ok(httparse::Status::Complete(_)) => Some(collect(resp.headers)),
            _ => None,
        }
    }

    fn record(&self, data: &[u8], skip_informational: bool) {
        let mut shared = self.lock();
        if shared.complete || data.is_empty() {
            return;
        }
        shared.received.extend_from_slice(data);
        loop {
            let Some(pos) = memmem::find(&shared.received, b"\r\n\r\n") else {
                if shared.received.len() > HEAD_MAX {
                    shared.received.clear();
                    shared.complete = true;
                }
                return;
            };
            if skip_informational && is_informational(&shared.received) {
                shared.received.drain(..pos + 4);
                continue;
            }
            shared.received.truncate(pos + 4);
            shared.complete = true;
            return;
        }
    }
}

fn collect(headers: &[httparse::Header<'_>]) -> HeaderSet {
    HeaderSet::from_raw(
        headers
            .iter()
            .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value).into_owned()))
            .collect(),
    )
}

fn is_informational(head: &[u8]) -> bool {
    head.starts_with(b"HTTP/1.") && head.get(9) == Some(&b'1')
}

/// Position inside the head being written.
#[derive(Debug, Clone, Default)]
enum HeadScan {
    #[default]
    StartLine,
    LineStart,
    Name(Vec<u8>),
    Value,
    Blank,
    Done,
}

impl HeadScan {
    fn is_done(&self) -> bool {
        matches!(self, HeadScan::Done)
    }

    /// Rewrites the names in `buf` and returns the bytes to write plus how
    /// many of them to offer. With `hold_partial`, a name cut off by the end
    /// of `buf` is held back for the next write.
    fn rewrite(&mut self, buf: &[u8], casing: &HeaderCasing, hold_partial: bool) -> (Vec<u8>, usize) {
        let mut out = buf.to_vec();
        let mut name_start = None;
        for (i, &b) in buf.iter().enumerate() {
            let next = match self {
                HeadScan::Done => return (out, buf.len()),
                HeadScan::StartLine | HeadScan::Value => (b == b'\n').then_some(HeadScan::LineStart),
                HeadScan::LineStart => match b {
                    b'\r' => Some(HeadScan::Blank),
                    b'\n' => Some(HeadScan::Done),
                    _ => {
                        name_start = Some(i);
                        Some(HeadScan::Name(vec![b]))
                    }
                },
                HeadScan::Name(acc) if b == b':' => {
                    let from = name_start.unwrap_or(0);
                    if let Some(cased) = casing.get(acc).map(str::as_bytes) {
                        if cased.len() == acc.len() {
                            let in_buf = i - from;
                            out[from..i].copy_from_slice(&cased[cased.len() - in_buf..]);
                        }
                    }
                    Some(HeadScan::Value)
                }
                HeadScan::Name(acc) => {
                    acc.push(b);
                    None
                }
                HeadScan::Blank => Some(HeadScan::Done),
            };
            if let Some(next) = next {
                *self = next;
            }
        }
        let take = match (&*self, name_start) {
            (HeadScan::Name(_), Some(start)) if hold_partial && start > 0 => start,
            _ => buf.len(),
        };
        (out, take)
    }
}

/// Stream wrapper restoring header-name casing around hyper.
pub(crate) struct CaseTap<S> {
    inner: S,
    shared: TapHandle,
    skip_informational: bool,
    scan: HeadScan,
}

impl<S> CaseTap<S> {
    /// `skip_informational` makes the tap keep the first final response
    /// head instead of an interim `1xx` one.
    pub(crate) fn new(inner: S, skip_informational: bool) -> (Self, TapHandle) {
        let shared = TapHandle::default();
        let tap = Self {
            inner,
            shared: shared.clone(),
            skip_informational,
            scan: HeadScan::default(),
        };
        (tap, shared)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CaseTap<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.shared
            .record(&buf.filled()[before..], this.skip_informational);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CaseTap<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.scan.is_done() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let casing = this.shared.lock().casing.clone();
        let (out, take) = this.scan.clone().rewrite(buf, &casing, true);
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &out[..take]))?;
        this.scan.rewrite(&buf[..n], &casing, false);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
