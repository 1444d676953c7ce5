//! One request/response exchange as seen by filters and the forward engine.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{Method, StatusCode, Uri, Version};
use http_body_util::StreamBody;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::Response;
use hyper::body::Frame;
use rand::{Rng, distributions::Alphanumeric};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::headers::HeaderSet;
use crate::proxy::casing::HeaderCasing;

pub type RequestBody = UnsyncBoxBody<Bytes, hyper::Error>;
pub type BodyFrame = Result<Frame<Bytes>, Infallible>;
pub type ClientBody = StreamBody<UnboundedReceiverStream<BodyFrame>>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Receives every exchange an internal server publishes.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, req: ProxyRequest, res: ResponseWriter) -> HandlerFuture;
}

impl<F> RequestHandler for F
where
    F: Fn(ProxyRequest, ResponseWriter) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, req: ProxyRequest, res: ResponseWriter) -> HandlerFuture {
        self(req, res)
    }
}

pub(crate) fn gen_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// A client request with an absolute URL and conditioned headers.
pub struct ProxyRequest {
    id: String,
    pub method: Method,
    pub url: Uri,
    pub version: Version,
    pub headers: HeaderSet,
    body: Option<RequestBody>,
    server: String,
}

impl ProxyRequest {
    pub fn new(method: Method, url: Uri, headers: HeaderSet) -> Self {
        Self {
            id: gen_id(),
            method,
            url,
            version: Version::HTTP_11,
            headers,
            body: None,
            server: String::new(),
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub(crate) fn with_server(mut self, name: &str) -> Self {
        self.server = name.to_string();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the internal server that received the request.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host()
    }

    /// The inbound body, once. `None` if already taken or never present.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderSet,
}

type HeadHook = Box<dyn FnOnce(&mut ResponseHead) + Send>;

/// Write side of the client response.
///
/// The head is sent at most once: explicitly via [`write_head`], or
/// implicitly as an empty `200` by the first [`write`], by [`end`], or when
/// the writer is dropped. A writer dropped during a panic sends `502`.
///
/// [`write_head`]: ResponseWriter::write_head
/// [`write`]: ResponseWriter::write
/// [`end`]: ResponseWriter::end
pub struct ResponseWriter {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::UnboundedSender<BodyFrame>>,
    hooks: Vec<HeadHook>,
}

impl ResponseWriter {
    pub fn channel() -> (ResponseWriter, ResponseReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        (
            ResponseWriter {
                head_tx: Some(head_tx),
                body_tx: Some(body_tx),
                hooks: Vec::new(),
            },
            ResponseReceiver { head_rx, body_rx },
        )
    }

    /// Runs `hook` on the head right before it is sent. Hooks registered
    /// after the head went out are dropped.
    pub fn on_head(&mut self, hook: impl FnOnce(&mut ResponseHead) + Send + 'static) {
        if !self.is_head_sent() {
            self.hooks.push(Box::new(hook));
        }
    }

    pub fn is_head_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    pub fn is_ended(&self) -> bool {
        self.body_tx.is_none()
    }

    /// Returns false if a head was already sent.
    pub fn write_head(&mut self, status: StatusCode, headers: HeaderSet) -> bool {
        let Some(tx) = self.head_tx.take() else {
            return false;
        };
        let mut head = ResponseHead { status, headers };
        for hook in self.hooks.drain(..) {
            hook(&mut head);
        }
        // client may already be gone
        let _ = tx.send(head);
        true
    }

    /// Returns false once the response has ended or the client went away.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> bool {
        if !self.is_head_sent() {
            self.write_head(StatusCode::OK, HeaderSet::default());
        }
        match &self.body_tx {
            Some(tx) => tx.send(Ok(Frame::data(chunk.into()))).is_ok(),
            None => false,
        }
    }

    pub fn end(&mut self) {
        if !self.is_head_sent() {
            self.write_head(StatusCode::OK, HeaderSet::default());
        }
        self.body_tx = None;
    }

    /// Head, optional body and end in one call.
    pub fn respond(&mut self, status: StatusCode, headers: HeaderSet, body: impl Into<Bytes>) {
        let body = body.into();
        self.write_head(status, headers);
        if !body.is_empty() {
            self.write(body);
        }
        self.end();
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.is_head_sent() {
            let status = if std::thread::panicking() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            self.write_head(status, HeaderSet::default());
        }
    }
}

/// Read side of a [`ResponseWriter`], owned by the internal server.
pub struct ResponseReceiver {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::UnboundedReceiver<BodyFrame>,
}

impl ResponseReceiver {
    pub async fn head(&mut self) -> Option<ResponseHead> {
        (&mut self.head_rx).await.ok()
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            match self.body_rx.recv().await? {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        return Some(data);
                    }
                }
                Err(never) => match never {},
            }
        }
    }

    /// Waits for the head and streams the body as it is written.
    pub async fn into_response(mut self) -> Response<ClientBody> {
        let head = self.head().await.unwrap_or_else(|| ResponseHead {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderSet::default(),
        });
        let mut resp = Response::new(StreamBody::new(UnboundedReceiverStream::new(self.body_rx)));
        *resp.status_mut() = head.status;
        *resp.headers_mut() = head.headers.to_http_all();
        resp.extensions_mut().insert(HeaderCasing::of(&head.headers));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Header;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn write_sends_implicit_head() {
        let (mut w, mut r) = ResponseWriter::channel();
        assert!(w.write("abc"));
        assert!(w.is_head_sent());
        w.end();
        assert!(!w.write("late"));
        let head = r.head().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(r.next_chunk().await.unwrap(), "abc");
        assert!(r.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn hooks_rewrite_head_once() {
        let (mut w, mut r) = ResponseWriter::channel();
        w.on_head(|head| {
            head.status = StatusCode::NOT_FOUND;
            head.headers.set("X-Hooked", "1");
        });
        assert!(w.write_head(StatusCode::OK, HeaderSet::default()));
        assert!(!w.write_head(StatusCode::CREATED, HeaderSet::default()));
        w.end();
        let head = r.head().await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.headers.get("x-hooked"), Some("1"));
    }

    #[tokio::test]
    async fn dropped_writer_sends_empty_ok() {
        let (w, r) = ResponseWriter::channel();
        drop(w);
        let resp = r.into_response().await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_yields_bad_gateway() {
        let (w, mut r) = ResponseWriter::channel();
        let task = tokio::spawn(async move {
            let _w = w;
            panic!("handler failed");
        });
        assert!(task.await.is_err());
        assert_eq!(r.head().await.unwrap().status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn response_keeps_duplicate_headers() {
        let (mut w, r) = ResponseWriter::channel();
        let headers = HeaderSet::from_raw(vec![
            Header::new("Set-Cookie", "a=1"),
            Header::new("Set-Cookie", "b=2"),
        ]);
        w.respond(StatusCode::ACCEPTED, headers, "done");
        let resp = r.into_response().await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers().get_all("set-cookie").iter().count(), 2);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "done");
    }

    #[test]
    fn ids_are_unique() {
        let a = ProxyRequest::new(Method::GET, Uri::from_static("http://a/"), HeaderSet::default());
        let b = ProxyRequest::new(Method::GET, Uri::from_static("http://a/"), HeaderSet::default());
        assert_eq!(a.id().len(), 16);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.host(), Some("a"));
    }
}
